//! The message queue itself: two monotonic 64-bit counters and a fixed-size
//! element ring in shared memory.
//!
//! The number of readable elements is `write_counter - read_counter`; free
//! space is the capacity minus that. Counter publishes use release ordering
//! and the counter loads that gate a copy use acquire ordering, which is the
//! only fencing the payload bytes need. Neither flavor takes a lock anywhere
//! on the data path.
//!
//! Endpoints are created either by [`MessageQueue::create`] (allocates the
//! backing shared memory) or [`MessageQueue::from_descriptor`] (attaches to
//! memory another process allocated). Construction is the only fallible
//! surface; the data-path operations report plain `bool` and log their
//! diagnostic kind at debug level.

use std::marker::PhantomData;
use std::mem;
use std::os::fd::AsFd;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::core::{
    create_shared_fd, QueueConfig, Region, SegmentLayout, COUNTER_EXTENT, FLAG_EXTENT,
};
use crate::descriptor::{Grantor, GrantorDescriptor, GRANTOR_FLAG_EVENT_WORD};
use crate::errors::FmqError;
use crate::flag::{EventFlag, NOT_EMPTY, NOT_FULL};

/// Marker for element types that may cross the shared-memory boundary.
///
/// # Safety
///
/// Implementors must be plain old data: `Copy`, no pointers, and valid for
/// every bit pattern, because peer processes exchange raw bytes with no
/// validation in between.
pub unsafe trait Quantum: Copy {}

macro_rules! impl_quantum {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: primitive scalars are valid for every bit pattern.
            unsafe impl Quantum for $ty {}
        )*
    };
}

impl_quantum!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

// SAFETY: arrays of plain old data are plain old data.
unsafe impl<T: Quantum, const N: usize> Quantum for [T; N] {}

mod sealed {
    pub trait Sealed {}
}

/// Queue synchronization mode, chosen at the type level.
///
/// The two flavors share the non-blocking surface but differ in who owns the
/// read position, so they are separate types rather than a runtime branch on
/// every counter store.
pub trait Flavor: sealed::Sealed {}

/// Single producer, single consumer.
///
/// The read counter lives in shared memory and writers respect it, so a
/// write never clobbers unread data. Attaching more than one consumer to the
/// same descriptor is undefined: the protocol has exactly one reader slot.
/// The same applies after fork if both parent and child read.
pub enum SynchronizedReadWrite {}

/// Single writer, any number of independent readers.
///
/// The writer never fails (beyond the capacity check) and overwrites the
/// oldest elements when the ring is full. Every reader endpoint tracks its
/// own position privately and detects when the writer has lapped it; readers
/// never see each other. After fork, parent and child are simply two more
/// independent readers.
pub enum UnsynchronizedWrite {}

impl sealed::Sealed for SynchronizedReadWrite {}
impl Flavor for SynchronizedReadWrite {}
impl sealed::Sealed for UnsynchronizedWrite {}
impl Flavor for UnsynchronizedWrite {}

/// Why a non-blocking operation reported `false`. Logged, never surfaced:
/// the public contract collapses all of these to "not now".
#[derive(Debug, Clone, Copy)]
enum OpFailure {
    TooLarge { requested: usize, capacity: usize },
    NotEnough { requested: usize, available: u64 },
    Overflow { behind: u64 },
}

impl OpFailure {
    fn log(self) {
        match self {
            OpFailure::TooLarge {
                requested,
                capacity,
            } => {
                tracing::debug!(requested, capacity, "burst larger than the queue");
            }
            OpFailure::NotEnough {
                requested,
                available,
            } => {
                tracing::debug!(requested, available, "queue has too few elements or slots");
            }
            OpFailure::Overflow { behind } => {
                tracing::debug!(behind, "writer overran this reader; resynchronized at the head");
            }
        }
    }
}

/// A queue endpoint: one participant's view of the shared ring.
///
/// An endpoint owns its mappings (released on drop) and a copy of the
/// descriptor handles; the backing pages live until the last mapping goes
/// away. There is no teardown protocol between peers: a peer that unmaps
/// simply stops participating, and blocking calls against a torn-down queue
/// end in a timeout.
pub struct MessageQueue<T: Quantum, F: Flavor> {
    data: Region,
    read_counter_region: Region,
    write_counter_region: Region,
    event_flag: Option<EventFlag>,
    descriptor: GrantorDescriptor,
    quantum_count: usize,
    /// Reader-private position, used only by the Unsynchronized flavor.
    local_read: u64,
    _flavor: PhantomData<(T, F)>,
}

impl<T: Quantum, F: Flavor> MessageQueue<T, F> {
    /// Allocate shared memory for a fresh queue and become its first
    /// endpoint.
    ///
    /// The creator zeroes both counters and the event-flag word; peers
    /// attach with [`MessageQueue::from_descriptor`] and need no further
    /// initialization.
    pub fn create(config: &QueueConfig) -> Result<Self, FmqError> {
        let quantum_size = mem::size_of::<T>();
        if quantum_size == 0 {
            return Err(FmqError::Logic("zero-sized quantum type".into()));
        }
        let layout = SegmentLayout::compute(config.quantum_count, quantum_size, config.event_flag)?;
        let fd = create_shared_fd(layout.total_len)?;
        let mut grantors = vec![
            Grantor {
                flags: 0,
                fd_index: 0,
                offset: 0,
                extent: layout.data_extent,
            },
            Grantor {
                flags: 0,
                fd_index: 0,
                offset: layout.read_counter_offset,
                extent: COUNTER_EXTENT,
            },
            Grantor {
                flags: 0,
                fd_index: 0,
                offset: layout.write_counter_offset,
                extent: COUNTER_EXTENT,
            },
        ];
        if let Some(offset) = layout.event_flag_offset {
            grantors.push(Grantor {
                flags: GRANTOR_FLAG_EVENT_WORD,
                fd_index: 0,
                offset,
                extent: FLAG_EXTENT,
            });
        }
        let queue = Self::from_descriptor(GrantorDescriptor::new(grantors, vec![fd])?)?;
        // ftruncate already zero-fills; make the initial state explicit.
        queue.read_counter().store(0, Ordering::Release);
        queue.write_counter().store(0, Ordering::Release);
        if let Some(flag) = &queue.event_flag {
            flag.reset();
        }
        Ok(queue)
    }

    /// Attach to an existing queue through its descriptor.
    ///
    /// The descriptor (including its handles) is consumed; use
    /// [`MessageQueue::descriptor`] to mint further copies.
    pub fn from_descriptor(descriptor: GrantorDescriptor) -> Result<Self, FmqError> {
        let quantum_size = mem::size_of::<T>();
        if quantum_size == 0 {
            return Err(FmqError::Logic("zero-sized quantum type".into()));
        }
        let data_grantor = *descriptor.data();
        if data_grantor.offset % mem::align_of::<T>() as u64 != 0 {
            return Err(FmqError::MalformedDescriptor(format!(
                "data region offset {} is misaligned for the element type",
                data_grantor.offset
            )));
        }
        if data_grantor.extent % quantum_size as u64 != 0 {
            return Err(FmqError::MalformedDescriptor(format!(
                "data region extent {} is not a whole number of {}-byte elements",
                data_grantor.extent, quantum_size
            )));
        }
        let quantum_count = usize::try_from(data_grantor.extent / quantum_size as u64)
            .map_err(|_| FmqError::MalformedDescriptor("data region too large".into()))?;
        let data_len = usize::try_from(data_grantor.extent)
            .map_err(|_| FmqError::MalformedDescriptor("data region too large".into()))?;

        let read_grantor = *descriptor.read_counter();
        let write_grantor = *descriptor.write_counter();
        let flag_grantor = descriptor.event_flag().copied();

        let data = Region::map(
            descriptor.handles()[data_grantor.fd_index as usize].as_fd(),
            data_grantor.offset,
            data_len,
        )?;
        let read_counter_region = Region::map(
            descriptor.handles()[read_grantor.fd_index as usize].as_fd(),
            read_grantor.offset,
            COUNTER_EXTENT as usize,
        )?;
        let write_counter_region = Region::map(
            descriptor.handles()[write_grantor.fd_index as usize].as_fd(),
            write_grantor.offset,
            COUNTER_EXTENT as usize,
        )?;
        let event_flag = match flag_grantor {
            Some(grantor) => Some(EventFlag::from_region(Region::map(
                descriptor.handles()[grantor.fd_index as usize].as_fd(),
                grantor.offset,
                FLAG_EXTENT as usize,
            )?)?),
            None => None,
        };
        Ok(MessageQueue {
            data,
            read_counter_region,
            write_counter_region,
            event_flag,
            descriptor,
            quantum_count,
            local_read: 0,
            _flavor: PhantomData,
        })
    }

    /// Produce a descriptor equivalent to the one this endpoint was built
    /// from, with freshly duplicated handles.
    ///
    /// Meant for sharing an Unsynchronized queue with further readers;
    /// handing a second consumer a Synchronized queue is a caller error that
    /// is not enforced here.
    pub fn descriptor(&self) -> Result<GrantorDescriptor, FmqError> {
        self.descriptor.try_clone()
    }

    /// Capacity in elements.
    #[inline]
    pub fn quantum_count(&self) -> usize {
        self.quantum_count
    }

    /// Size of one element in bytes.
    #[inline]
    pub fn quantum_size(&self) -> usize {
        mem::size_of::<T>()
    }

    /// Whether attach succeeded and the endpoint is operational. Endpoints
    /// that fail construction are never handed out, so this is true for the
    /// lifetime of the value; it exists for surface parity with bindings
    /// that cannot express fallible construction.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.quantum_count != 0
    }

    /// The embedded event flag, if the creator asked for one. Callers may
    /// wait on or wake their own bits (2 and up) directly.
    #[inline]
    pub fn event_flag(&self) -> Option<&EventFlag> {
        self.event_flag.as_ref()
    }

    /// Supply an external event flag for a queue created without an embedded
    /// one. This is how one flag word (and one futex) can serve several
    /// queues, each on its own bits.
    ///
    /// Fails if the queue already has a flag.
    pub fn attach_event_flag(&mut self, flag: EventFlag) -> Result<(), FmqError> {
        if self.event_flag.is_some() {
            return Err(FmqError::Logic("queue already has an event flag".into()));
        }
        self.event_flag = Some(flag);
        Ok(())
    }

    #[inline]
    fn read_counter(&self) -> &AtomicU64 {
        // SAFETY: the region is 8 bytes at an 8-aligned offset
        // (descriptor-validated) and outlives self.
        unsafe { &*(self.read_counter_region.as_ptr() as *const AtomicU64) }
    }

    #[inline]
    fn write_counter(&self) -> &AtomicU64 {
        // SAFETY: as for read_counter.
        unsafe { &*(self.write_counter_region.as_ptr() as *const AtomicU64) }
    }

    /// Copy `data` into the slots starting at logical position `pos`,
    /// splitting into two runs when the copy crosses the ring edge.
    ///
    /// # Safety
    ///
    /// Caller must be the sole producer and must have established that the
    /// target slots are writable under its flavor's rules.
    unsafe fn copy_in(&self, pos: u64, data: &[T]) {
        let capacity = self.quantum_count;
        let index = (pos % capacity as u64) as usize;
        let first = data.len().min(capacity - index);
        let base = self.data.as_ptr() as *mut T;
        ptr::copy_nonoverlapping(data.as_ptr(), base.add(index), first);
        if first < data.len() {
            ptr::copy_nonoverlapping(data.as_ptr().add(first), base, data.len() - first);
        }
    }

    /// Copy out of the slots starting at logical position `pos`, two runs at
    /// the ring edge.
    ///
    /// # Safety
    ///
    /// Caller must have observed (acquire) a write counter covering
    /// `[pos, pos + data.len())`.
    unsafe fn copy_out(&self, pos: u64, data: &mut [T]) {
        let capacity = self.quantum_count;
        let index = (pos % capacity as u64) as usize;
        let first = data.len().min(capacity - index);
        let base = self.data.as_ptr() as *const T;
        ptr::copy_nonoverlapping(base.add(index), data.as_mut_ptr(), first);
        if first < data.len() {
            ptr::copy_nonoverlapping(base, data.as_mut_ptr().add(first), data.len() - first);
        }
    }

    /// Retry `attempt` until it succeeds, waiting on `ready_bits` between
    /// tries; wake `notify_bits` on success. One deadline covers all
    /// retries. Only "not now" failures loop; anything else is final.
    fn run_blocking(
        &mut self,
        ready_bits: u32,
        notify_bits: u32,
        timeout: Duration,
        mut attempt: impl FnMut(&mut Self) -> Result<(), OpFailure>,
    ) -> bool {
        let started = Instant::now();
        loop {
            match attempt(self) {
                Ok(()) => {
                    if let Some(flag) = &self.event_flag {
                        let _ = flag.wake(notify_bits);
                    }
                    return true;
                }
                Err(OpFailure::NotEnough { .. }) => {}
                Err(failure) => {
                    failure.log();
                    return false;
                }
            }
            let Some(flag) = &self.event_flag else {
                tracing::debug!("blocking call on a queue without an event flag");
                return false;
            };
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return false;
            }
            match flag.wait(ready_bits, timeout - elapsed) {
                Ok(_) => {}
                Err(FmqError::Timeout) => return false,
                Err(e) => {
                    tracing::warn!("blocking wait failed: {}", e);
                    return false;
                }
            }
        }
    }
}

impl<T: Quantum> MessageQueue<T, SynchronizedReadWrite> {
    fn try_write(&mut self, data: &[T]) -> Result<(), OpFailure> {
        let n = data.len() as u64;
        if n > self.quantum_count as u64 {
            return Err(OpFailure::TooLarge {
                requested: data.len(),
                capacity: self.quantum_count,
            });
        }
        let read = self.read_counter().load(Ordering::Acquire);
        let write = self.write_counter().load(Ordering::Relaxed);
        let available = (self.quantum_count as u64).saturating_sub(write.wrapping_sub(read));
        if n > available {
            return Err(OpFailure::NotEnough {
                requested: data.len(),
                available,
            });
        }
        // SAFETY: sole producer; the consumer cannot enter [write, write + n)
        // until the release store below publishes it.
        unsafe { self.copy_in(write, data) };
        self.write_counter().store(write + n, Ordering::Release);
        Ok(())
    }

    fn try_read(&mut self, data: &mut [T]) -> Result<(), OpFailure> {
        let n = data.len() as u64;
        if n > self.quantum_count as u64 {
            return Err(OpFailure::TooLarge {
                requested: data.len(),
                capacity: self.quantum_count,
            });
        }
        let write = self.write_counter().load(Ordering::Acquire);
        let read = self.read_counter().load(Ordering::Relaxed);
        let available = write.wrapping_sub(read);
        if n > available {
            return Err(OpFailure::NotEnough {
                requested: data.len(),
                available,
            });
        }
        // SAFETY: the acquire load of the write counter covers these slots,
        // and the producer will not reuse them until the release store below.
        unsafe { self.copy_out(read, data) };
        self.read_counter().store(read + n, Ordering::Release);
        Ok(())
    }

    /// Write `data.len()` elements without blocking. Fails when the free
    /// space is insufficient or the burst exceeds the capacity; an empty
    /// slice succeeds without touching the queue.
    pub fn write(&mut self, data: &[T]) -> bool {
        if data.is_empty() {
            return true;
        }
        match self.try_write(data) {
            Ok(()) => true,
            Err(failure) => {
                failure.log();
                false
            }
        }
    }

    /// Read exactly `data.len()` elements without blocking. Fails when fewer
    /// are available; an empty slice succeeds without touching the queue.
    pub fn read(&mut self, data: &mut [T]) -> bool {
        if data.is_empty() {
            return true;
        }
        match self.try_read(data) {
            Ok(()) => true,
            Err(failure) => {
                failure.log();
                false
            }
        }
    }

    /// Write, sleeping on `ready_bits` while the queue is full and raising
    /// `notify_bits` once the elements are in.
    ///
    /// The timeout is a single budget from call start shared by every retry;
    /// `Duration::ZERO` makes exactly one non-blocking attempt. Returns
    /// false on timeout, an oversized burst, or a futex failure.
    pub fn write_blocking(
        &mut self,
        data: &[T],
        ready_bits: u32,
        notify_bits: u32,
        timeout: Duration,
    ) -> bool {
        if data.is_empty() {
            return true;
        }
        self.run_blocking(ready_bits, notify_bits, timeout, |queue| {
            queue.try_write(data)
        })
    }

    /// [`Self::write_blocking`] with the conventional bits: wait on
    /// [`NOT_FULL`], notify [`NOT_EMPTY`].
    pub fn write_blocking_default(&mut self, data: &[T], timeout: Duration) -> bool {
        self.write_blocking(data, NOT_FULL, NOT_EMPTY, timeout)
    }

    /// Blocking counterpart of [`Self::read`]; see
    /// [`Self::write_blocking`] for the timeout contract.
    pub fn read_blocking(
        &mut self,
        data: &mut [T],
        ready_bits: u32,
        notify_bits: u32,
        timeout: Duration,
    ) -> bool {
        if data.is_empty() {
            return true;
        }
        self.run_blocking(ready_bits, notify_bits, timeout, |queue| {
            queue.try_read(&mut *data)
        })
    }

    /// [`Self::read_blocking`] with the conventional bits: wait on
    /// [`NOT_EMPTY`], notify [`NOT_FULL`].
    pub fn read_blocking_default(&mut self, data: &mut [T], timeout: Duration) -> bool {
        self.read_blocking(data, NOT_EMPTY, NOT_FULL, timeout)
    }

    /// Elements currently readable. May be stale by the time the caller
    /// acts on it.
    pub fn available_to_read(&self) -> usize {
        let write = self.write_counter().load(Ordering::Acquire);
        let read = self.read_counter().load(Ordering::Acquire);
        write.wrapping_sub(read) as usize
    }

    /// Free slots. Stale in the same way as [`Self::available_to_read`].
    pub fn available_to_write(&self) -> usize {
        self.quantum_count.saturating_sub(self.available_to_read())
    }
}

impl<T: Quantum> MessageQueue<T, UnsynchronizedWrite> {
    fn try_write(&mut self, data: &[T]) -> Result<(), OpFailure> {
        let n = data.len() as u64;
        if n > self.quantum_count as u64 {
            return Err(OpFailure::TooLarge {
                requested: data.len(),
                capacity: self.quantum_count,
            });
        }
        let write = self.write_counter().load(Ordering::Relaxed);
        // The writer never waits: a full ring means the oldest elements get
        // overwritten and lagging readers find out on their own.
        unsafe { self.copy_in(write, data) };
        self.write_counter().store(write + n, Ordering::Release);
        Ok(())
    }

    fn try_read(&mut self, data: &mut [T]) -> Result<(), OpFailure> {
        let n = data.len() as u64;
        if n > self.quantum_count as u64 {
            return Err(OpFailure::TooLarge {
                requested: data.len(),
                capacity: self.quantum_count,
            });
        }
        let write = self.write_counter().load(Ordering::Acquire);
        let available = write.wrapping_sub(self.local_read);
        if available > self.quantum_count as u64 {
            // Lapped. Resync at the head so the next successful read returns
            // the newest elements; everything in between is lost.
            self.local_read = write;
            return Err(OpFailure::Overflow { behind: available });
        }
        if n > available {
            return Err(OpFailure::NotEnough {
                requested: data.len(),
                available,
            });
        }
        // SAFETY: the acquire load of the write counter covers these slots.
        // The writer may still lap us mid-copy; that is the documented data
        // hazard of this flavor, detected on the next read.
        unsafe { self.copy_out(self.local_read, data) };
        self.local_read += n;
        Ok(())
    }

    /// Write `data.len()` elements. Never fails for lack of space (a full
    /// ring overwrites the oldest elements), only for a burst larger than
    /// the capacity.
    pub fn write(&mut self, data: &[T]) -> bool {
        if data.is_empty() {
            return true;
        }
        match self.try_write(data) {
            Ok(()) => true,
            Err(failure) => {
                failure.log();
                false
            }
        }
    }

    /// Read exactly `data.len()` elements from this endpoint's private
    /// position.
    ///
    /// Fails when fewer are available, or when the writer has lapped this
    /// reader; in that case the position resynchronizes to the write head
    /// and the next read observes at most the newest `quantum_count`
    /// elements.
    pub fn read(&mut self, data: &mut [T]) -> bool {
        if data.is_empty() {
            return true;
        }
        match self.try_read(data) {
            Ok(()) => true,
            Err(failure) => {
                failure.log();
                false
            }
        }
    }

    /// Write and raise `notify_bits`. The writer never sleeps in this
    /// flavor (nothing ever raises [`NOT_FULL`]), so the timeout only
    /// matters for signature parity.
    pub fn write_blocking(
        &mut self,
        data: &[T],
        ready_bits: u32,
        notify_bits: u32,
        timeout: Duration,
    ) -> bool {
        if data.is_empty() {
            return true;
        }
        self.run_blocking(ready_bits, notify_bits, timeout, |queue| {
            queue.try_write(data)
        })
    }

    /// [`Self::write_blocking`] raising the conventional [`NOT_EMPTY`].
    pub fn write_blocking_default(&mut self, data: &[T], timeout: Duration) -> bool {
        self.write_blocking(data, 0, NOT_EMPTY, timeout)
    }

    /// Sleep on `ready_bits` until `data.len()` elements are readable.
    ///
    /// Returns false immediately when the writer has lapped this reader,
    /// since overflow is data loss rather than "not yet". The position is
    /// left resynced for the next call.
    pub fn read_blocking(
        &mut self,
        data: &mut [T],
        ready_bits: u32,
        notify_bits: u32,
        timeout: Duration,
    ) -> bool {
        if data.is_empty() {
            return true;
        }
        self.run_blocking(ready_bits, notify_bits, timeout, |queue| {
            queue.try_read(&mut *data)
        })
    }

    /// [`Self::read_blocking`] waiting on the conventional [`NOT_EMPTY`].
    /// Nothing is notified: readers never raise [`NOT_FULL`] in this flavor.
    pub fn read_blocking_default(&mut self, data: &mut [T], timeout: Duration) -> bool {
        self.read_blocking(data, NOT_EMPTY, 0, timeout)
    }

    /// Elements between this endpoint's position and the write head. A value
    /// above [`Self::quantum_count`] means the writer has lapped this reader
    /// and the next read will report overflow.
    pub fn available_to_read(&self) -> usize {
        let write = self.write_counter().load(Ordering::Acquire);
        write.wrapping_sub(self.local_read) as usize
    }

    /// Free slots relative to this endpoint's position. Purely advisory:
    /// the writer does not consult it.
    pub fn available_to_write(&self) -> usize {
        self.quantum_count.saturating_sub(self.available_to_read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type SyncQueue = MessageQueue<u16, SynchronizedReadWrite>;
    type UnsyncQueue = MessageQueue<u16, UnsynchronizedWrite>;

    fn sync_pair(quantum_count: usize) -> (SyncQueue, SyncQueue) {
        let config = QueueConfig::builder()
            .quantum_count(quantum_count)
            .event_flag(true)
            .build()
            .expect("config");
        let producer = SyncQueue::create(&config).expect("create");
        let consumer =
            SyncQueue::from_descriptor(producer.descriptor().expect("descriptor")).expect("attach");
        (producer, consumer)
    }

    fn unsync_writer(quantum_count: usize) -> UnsyncQueue {
        let config = QueueConfig::builder()
            .quantum_count(quantum_count)
            .event_flag(true)
            .build()
            .expect("config");
        UnsyncQueue::create(&config).expect("create")
    }

    fn pattern(len: usize) -> Vec<u16> {
        (0..len).map(|i| i as u16).collect()
    }

    #[test]
    fn roundtrip_restores_free_space() {
        let (mut producer, mut consumer) = sync_pair(1024);
        let before = producer.available_to_write();
        let data = pattern(16);
        assert!(producer.write(&data));
        let mut out = vec![0u16; 16];
        assert!(consumer.read(&mut out));
        assert_eq!(out, data);
        assert_eq!(producer.available_to_write(), before);
    }

    #[test]
    fn introspection_reports_geometry() {
        let (producer, _consumer) = sync_pair(512);
        assert!(producer.is_valid());
        assert_eq!(producer.quantum_count(), 512);
        assert_eq!(producer.quantum_size(), 2);
        assert!(producer.event_flag().is_some());
    }

    #[test]
    fn read_when_empty_fails() {
        let (_producer, mut consumer) = sync_pair(1024);
        assert_eq!(consumer.available_to_read(), 0);
        let mut out = [0u16; 2];
        assert!(!consumer.read(&mut out));
    }

    #[test]
    fn zero_length_succeeds_without_side_effects() {
        let (mut producer, mut consumer) = sync_pair(64);
        assert!(producer.write(&[]));
        assert!(consumer.read(&mut []));
        assert!(producer.write_blocking_default(&[], Duration::ZERO));
        assert!(consumer.read_blocking_default(&mut [], Duration::ZERO));
        assert_eq!(consumer.available_to_read(), 0);
        // The event flag was never touched either.
        let flag = producer.event_flag().expect("flag");
        assert!(matches!(
            flag.wait(NOT_EMPTY | NOT_FULL, Duration::ZERO),
            Err(FmqError::Timeout)
        ));
    }

    #[test]
    fn oversize_fails_without_state_change() {
        let (mut producer, mut consumer) = sync_pair(64);
        let data = pattern(65);
        assert!(!producer.write(&data));
        assert_eq!(consumer.available_to_read(), 0);
        let mut out = vec![0u16; 65];
        assert!(!consumer.read(&mut out));
        // Queue is still fully usable.
        assert!(producer.write(&pattern(64)));
        assert_eq!(consumer.available_to_read(), 64);
    }

    #[test]
    fn write_when_full_fails_until_read() {
        let (mut producer, mut consumer) = sync_pair(1024);
        let data = pattern(1024);
        assert!(producer.write(&data));
        assert_eq!(producer.available_to_write(), 0);
        assert!(!producer.write(&data[..1]));
        let mut out = vec![0u16; 1024];
        assert!(consumer.read(&mut out));
        assert_eq!(out, data);
        assert!(producer.write(&data[..1]));
    }

    #[test]
    fn counts_always_partition_the_capacity() {
        let (mut producer, mut consumer) = sync_pair(256);
        let mut out = vec![0u16; 96];
        for round in 0..10 {
            assert!(producer.write(&pattern(96)));
            assert_eq!(
                producer.available_to_read() + producer.available_to_write(),
                256,
                "round {}",
                round
            );
            assert!(consumer.read(&mut out));
            assert_eq!(
                consumer.available_to_read() + consumer.available_to_write(),
                256,
                "round {}",
                round
            );
        }
    }

    #[test]
    fn chunked_reads_concatenate_in_order() {
        let (mut producer, mut consumer) = sync_pair(1024);
        assert!(producer.write(&pattern(500)));
        let mut out = vec![0u16; 500];
        for chunk in out.chunks_mut(100) {
            assert!(consumer.read(chunk));
        }
        assert_eq!(out, pattern(500));
    }

    #[test]
    fn wraparound_preserves_order() {
        let (mut producer, mut consumer) = sync_pair(1024);
        // Advance the counters half way so the next full write wraps.
        assert!(producer.write(&pattern(512)));
        let mut half = vec![0u16; 512];
        assert!(consumer.read(&mut half));
        let data = pattern(1024);
        assert!(producer.write(&data));
        let mut out = vec![0u16; 1024];
        assert!(consumer.read(&mut out));
        assert_eq!(out, data);
    }

    #[test]
    fn wraparound_split_is_not_a_single_copy() {
        // Capacity 8, positions advanced to 6: a 5-element write must land
        // as [6, 7] then [0, 1, 2].
        let (mut producer, mut consumer) = sync_pair(8);
        assert!(producer.write(&pattern(6)));
        let mut sink = vec![0u16; 6];
        assert!(consumer.read(&mut sink));
        let data = [100u16, 101, 102, 103, 104];
        assert!(producer.write(&data));
        let mut out = [0u16; 5];
        assert!(consumer.read(&mut out));
        assert_eq!(out, data);
    }

    #[test]
    fn blocking_read_times_out_when_empty() {
        let (_producer, mut consumer) = sync_pair(64);
        let mut out = [0u16; 4];
        let started = Instant::now();
        assert!(!consumer.read_blocking_default(&mut out, Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn blocking_write_times_out_when_full() {
        let (mut producer, _consumer) = sync_pair(16);
        assert!(producer.write(&pattern(16)));
        assert!(!producer.write_blocking_default(&pattern(1), Duration::from_millis(50)));
    }

    #[test]
    fn zero_timeout_is_a_single_attempt() {
        let (mut producer, mut consumer) = sync_pair(16);
        let mut out = [0u16; 1];
        let started = Instant::now();
        assert!(!consumer.read_blocking_default(&mut out, Duration::ZERO));
        assert!(started.elapsed() < Duration::from_millis(20));
        assert!(producer.write_blocking_default(&pattern(4), Duration::ZERO));
        assert!(consumer.read_blocking_default(&mut out, Duration::ZERO));
        assert_eq!(out[0], 0);
    }

    #[test]
    fn blocking_without_flag_fails_fast() {
        let config = QueueConfig::builder()
            .quantum_count(16)
            .event_flag(false)
            .build()
            .expect("config");
        let mut queue = SyncQueue::create(&config).expect("create");
        let mut out = [0u16; 1];
        assert!(queue.event_flag().is_none());
        assert!(!queue.read_blocking_default(&mut out, Duration::from_secs(5)));
    }

    #[test]
    fn attach_rejects_misaligned_data_region() {
        // A byte queue's descriptor can sit at any offset; a u16 queue's
        // cannot sit at an odd one.
        let config = QueueConfig::builder().quantum_count(64).build().expect("config");
        let byte_queue = MessageQueue::<u8, SynchronizedReadWrite>::create(&config).expect("create");
        let descriptor = byte_queue.descriptor().expect("descriptor");
        let mut grantors = descriptor.grantors().to_vec();
        grantors[0].offset = 1;
        grantors[0].extent = 32;
        let handles = descriptor
            .handles()
            .iter()
            .map(|fd| fd.try_clone().expect("dup"))
            .collect();
        let skewed = GrantorDescriptor::new(grantors, handles).expect("descriptor");
        let result = MessageQueue::<u16, SynchronizedReadWrite>::from_descriptor(skewed);
        assert!(matches!(result, Err(FmqError::MalformedDescriptor(_))));
    }

    #[test]
    fn unsync_write_when_full_succeeds() {
        let mut writer = unsync_writer(64);
        assert!(writer.write(&pattern(64)));
        assert_eq!(writer.available_to_write(), 0);
        assert!(writer.write(&pattern(1)));
    }

    #[test]
    fn unsync_oversize_still_fails() {
        let mut writer = unsync_writer(64);
        assert!(!writer.write(&pattern(65)));
    }

    #[test]
    fn unsync_overflow_resyncs_and_recovers() {
        let mut writer = unsync_writer(64);
        let mut reader =
            UnsyncQueue::from_descriptor(writer.descriptor().expect("descriptor")).expect("attach");
        assert!(writer.write(&pattern(64)));
        assert!(writer.write(&pattern(1)));
        // Lapped: the read fails once and resynchronizes.
        let mut out = vec![0u16; 64];
        assert!(!reader.read(&mut out));
        assert_eq!(reader.available_to_read(), 0);
        // New writes are readable again.
        let fresh = [7u16; 16];
        assert!(writer.write(&fresh));
        let mut out = [0u16; 16];
        assert!(reader.read(&mut out));
        assert_eq!(out, fresh);
    }

    #[test]
    fn unsync_readers_are_independent() {
        let mut writer = unsync_writer(64);
        let mut first =
            UnsyncQueue::from_descriptor(writer.descriptor().expect("descriptor")).expect("attach");
        let mut second =
            UnsyncQueue::from_descriptor(writer.descriptor().expect("descriptor")).expect("attach");
        let data = pattern(16);
        assert!(writer.write(&data));
        let mut out = [0u16; 16];
        assert!(first.read(&mut out));
        assert_eq!(out.as_slice(), data.as_slice());
        let mut out = [0u16; 16];
        assert!(second.read(&mut out));
        assert_eq!(out.as_slice(), data.as_slice());
    }

    #[test]
    fn unsync_blocking_write_never_waits() {
        let mut writer = unsync_writer(8);
        assert!(writer.write(&pattern(8)));
        let started = Instant::now();
        assert!(writer.write_blocking_default(&pattern(8), Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn unsync_blocking_read_fails_fast_on_overflow() {
        let mut writer = unsync_writer(8);
        let mut reader =
            UnsyncQueue::from_descriptor(writer.descriptor().expect("descriptor")).expect("attach");
        assert!(writer.write(&pattern(8)));
        assert!(writer.write(&pattern(1)));
        let mut out = [0u16; 8];
        let started = Instant::now();
        assert!(!reader.read_blocking_default(&mut out, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn wide_elements_roundtrip() {
        // Arrays are quanta too; exercise a 16-byte element.
        let config = QueueConfig::builder().quantum_count(32).build().expect("config");
        let mut producer =
            MessageQueue::<[u32; 4], SynchronizedReadWrite>::create(&config).expect("create");
        let mut consumer = MessageQueue::<[u32; 4], SynchronizedReadWrite>::from_descriptor(
            producer.descriptor().expect("descriptor"),
        )
        .expect("attach");
        let data: Vec<[u32; 4]> = (0..32u32).map(|i| [i, i + 1, i + 2, i + 3]).collect();
        assert!(producer.write(&data));
        let mut out = vec![[0u32; 4]; 32];
        assert!(consumer.read(&mut out));
        assert_eq!(out, data);
    }
}
