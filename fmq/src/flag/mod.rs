//! Bit-masked wake-up flag shared between processes.
//!
//! An [`EventFlag`] is a 32-bit word in shared memory plus the futex calls to
//! sleep on it. Wakers *latch* bits into the word before issuing the kernel
//! wake, and waiters consume bits with an atomic read-modify-write before
//! parking, so a wake that lands between a failed queue operation and the
//! subsequent wait is never lost.
//!
//! The queue uses the two low bits ([`NOT_EMPTY`], [`NOT_FULL`]); bits 2 and
//! up are free for callers multiplexing their own events on a shared flag.

mod futex;

use std::os::fd::BorrowedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nix::errno::Errno;

use crate::core::{Region, FLAG_EXTENT};
use crate::errors::FmqError;

/// Raised by a writer after it publishes; blocking readers wait on it.
pub const NOT_EMPTY: u32 = 1 << 0;
/// Raised by a reader after it frees slots; blocking writers wait on it.
pub const NOT_FULL: u32 = 1 << 1;

pub struct EventFlag {
    word: NonNull<AtomicU32>,
    _region: Region,
}

// SAFETY: the flag word is only ever accessed through atomic RMW operations.
unsafe impl Send for EventFlag {}
unsafe impl Sync for EventFlag {}

impl EventFlag {
    /// Map a standalone flag word at `offset` inside `fd`.
    ///
    /// This is the externally-supplied form: one word allocated by the caller
    /// can serve several queues, each using disjoint bits.
    pub fn new(fd: BorrowedFd<'_>, offset: u64) -> Result<Self, FmqError> {
        Self::from_region(Region::map(fd, offset, FLAG_EXTENT as usize)?)
    }

    pub(crate) fn from_region(region: Region) -> Result<Self, FmqError> {
        if region.len() < FLAG_EXTENT as usize {
            return Err(FmqError::Logic("event-flag region too small".into()));
        }
        let ptr = region.as_ptr();
        if ptr as usize % std::mem::align_of::<AtomicU32>() != 0 {
            return Err(FmqError::MalformedDescriptor(
                "event-flag word is misaligned".into(),
            ));
        }
        // SAFETY: non-null, aligned, and the four bytes stay mapped for as
        // long as `_region` lives.
        let word = unsafe { NonNull::new_unchecked(ptr.cast::<AtomicU32>()) };
        Ok(EventFlag {
            word,
            _region: region,
        })
    }

    #[inline]
    fn word(&self) -> &AtomicU32 {
        // SAFETY: backed by the mapping owned by `_region`.
        unsafe { self.word.as_ref() }
    }

    /// Creator-side initialization: no bits pending.
    pub(crate) fn reset(&self) {
        self.word().store(0, Ordering::Release);
    }

    /// Sleep until at least one bit in `mask` is set, then atomically clear
    /// and return the bits that were set.
    ///
    /// Bits already pending are consumed without entering the kernel. The
    /// timeout is a deadline measured from the call; retries after spurious
    /// wakes or signals share it. `Duration::ZERO` checks and returns without
    /// sleeping. Returns `FmqError::Timeout` when the deadline passes with no
    /// bit set.
    pub fn wait(&self, mask: u32, timeout: Duration) -> Result<u32, FmqError> {
        if mask == 0 {
            return Err(FmqError::Timeout);
        }
        let deadline = futex::monotonic_deadline(timeout);
        loop {
            let old = self.word().fetch_and(!mask, Ordering::AcqRel);
            let set = old & mask;
            if set != 0 {
                return Ok(set);
            }
            if timeout.is_zero() {
                return Err(FmqError::Timeout);
            }
            // The word still equals `old` unless someone raced in a bit, in
            // which case the kernel reports EAGAIN and the loop re-checks.
            match futex::wait_bitset(self.word(), old, mask, &deadline) {
                Ok(()) => {}
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                Err(Errno::ETIMEDOUT) => return Err(FmqError::Timeout),
                Err(e) => {
                    tracing::warn!("futex wait failed: {}", e);
                    return Err(FmqError::Futex(e));
                }
            }
        }
    }

    /// Set the bits in `mask`, then wake every waiter whose wait mask
    /// intersects them.
    pub fn wake(&self, mask: u32) -> Result<(), FmqError> {
        if mask == 0 {
            return Ok(());
        }
        self.word().fetch_or(mask, Ordering::AcqRel);
        match futex::wake_bitset(self.word(), mask) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("futex wake failed: {}", e);
                Err(FmqError::Futex(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::core::create_shared_fd;

    fn new_flag() -> EventFlag {
        let fd = create_shared_fd(4096).expect("memfd");
        let flag = EventFlag::new(fd.as_fd(), 0).expect("flag");
        flag.reset();
        flag
    }

    #[test]
    fn pending_bit_is_consumed_without_sleeping() -> Result<(), FmqError> {
        let flag = new_flag();
        flag.wake(NOT_EMPTY)?;
        assert_eq!(flag.wait(NOT_EMPTY, Duration::ZERO)?, NOT_EMPTY);
        // Consumed: the second wait sees nothing.
        assert!(matches!(
            flag.wait(NOT_EMPTY, Duration::ZERO),
            Err(FmqError::Timeout)
        ));
        Ok(())
    }

    #[test]
    fn wait_only_consumes_masked_bits() -> Result<(), FmqError> {
        let flag = new_flag();
        flag.wake(NOT_EMPTY | NOT_FULL)?;
        assert_eq!(flag.wait(NOT_FULL, Duration::ZERO)?, NOT_FULL);
        // The other bit is still latched.
        assert_eq!(flag.wait(NOT_EMPTY, Duration::ZERO)?, NOT_EMPTY);
        Ok(())
    }

    #[test]
    fn wait_times_out() {
        let flag = new_flag();
        let started = Instant::now();
        let result = flag.wait(NOT_EMPTY, Duration::from_millis(50));
        assert!(matches!(result, Err(FmqError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn zero_mask_never_blocks() {
        let flag = new_flag();
        assert!(matches!(
            flag.wait(0, Duration::from_secs(5)),
            Err(FmqError::Timeout)
        ));
        assert!(flag.wake(0).is_ok());
    }

    #[test]
    fn wake_crosses_threads() {
        let fd = create_shared_fd(4096).expect("memfd");
        let waiter = EventFlag::new(fd.as_fd(), 0).expect("flag");
        waiter.reset();
        let waker = EventFlag::new(fd.as_fd(), 0).expect("flag");

        let handle = thread::spawn(move || waiter.wait(NOT_EMPTY, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        waker.wake(NOT_EMPTY).expect("wake");
        let woken = handle.join().expect("join").expect("wait");
        assert_eq!(woken, NOT_EMPTY);
    }

    #[test]
    fn separate_mappings_share_the_word() -> Result<(), FmqError> {
        let fd = create_shared_fd(4096)?;
        let a = EventFlag::new(fd.as_fd(), 0)?;
        a.reset();
        let b = EventFlag::new(fd.as_fd(), 0)?;
        a.wake(NOT_FULL)?;
        assert_eq!(b.wait(NOT_FULL, Duration::ZERO)?, NOT_FULL);
        Ok(())
    }
}
