//! Raw futex bitset wrappers.
//!
//! The word lives in a MAP_SHARED mapping, so these never use the
//! private-futex optimization; the kernel must match waiters across
//! processes.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use nix::errno::Errno;

/// Block until the word changes from `expected` or a wake whose mask
/// intersects `mask` arrives. `deadline` is absolute CLOCK_MONOTONIC.
pub(super) fn wait_bitset(
    word: &AtomicU32,
    expected: u32,
    mask: u32,
    deadline: &libc::timespec,
) -> Result<(), Errno> {
    // SAFETY: word points into a live shared mapping; the kernel reads it and
    // parks the thread.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT_BITSET,
            expected,
            deadline as *const libc::timespec,
            ptr::null::<u32>(),
            mask,
        )
    };
    if rc < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Wake every waiter whose wait mask intersects `mask`.
pub(super) fn wake_bitset(word: &AtomicU32, mask: u32) -> Result<(), Errno> {
    // SAFETY: as above; FUTEX_WAKE_BITSET does not dereference the timeout.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE_BITSET,
            libc::INT_MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            mask,
        )
    };
    if rc < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Absolute CLOCK_MONOTONIC deadline `timeout` from now, saturating.
pub(super) fn monotonic_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: plain out-parameter call.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
    }
    let secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
    let mut sec = now.tv_sec.saturating_add(secs);
    let mut nsec = now.tv_nsec + i64::from(timeout.subsec_nanos());
    if nsec >= 1_000_000_000 {
        nsec -= 1_000_000_000;
        sec = sec.saturating_add(1);
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}
