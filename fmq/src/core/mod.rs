//! Shared-memory plumbing: allocation, page-aligned region mapping and the
//! byte layout of a queue's backing segment.
//!
//! The creator allocates one anonymous memfd and carves it into the regions
//! described by [`SegmentLayout`]; every participant (creator included) maps
//! each region through [`Region::map`], which hides the kernel's requirement
//! that mmap offsets be page-aligned.

use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use libc::c_void;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use serde_derive::{Deserialize, Serialize};

use crate::errors::FmqError;

/// Byte size of one shared counter region.
pub(crate) const COUNTER_EXTENT: u64 = 8;
/// Byte size of the event-flag word region.
pub(crate) const FLAG_EXTENT: u64 = 4;

pub const DEFAULT_QUANTUM_COUNT: usize = 1024;

/// Creation-time queue parameters. Immutable once the queue exists; peers
/// learn everything else from the descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Capacity in elements.
    pub quantum_count: usize,
    /// Whether to embed an event-flag word for the blocking APIs.
    pub event_flag: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            quantum_count: DEFAULT_QUANTUM_COUNT,
            event_flag: false,
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    quantum_count: Option<usize>,
    event_flag: bool,
}

impl QueueConfigBuilder {
    pub fn quantum_count(mut self, quantum_count: usize) -> Self {
        self.quantum_count = Some(quantum_count);
        self
    }

    pub fn event_flag(mut self, event_flag: bool) -> Self {
        self.event_flag = event_flag;
        self
    }

    pub fn build(self) -> Result<QueueConfig, FmqError> {
        let quantum_count = self.quantum_count.unwrap_or(DEFAULT_QUANTUM_COUNT);
        if quantum_count == 0 {
            return Err(FmqError::Logic(
                "quantum_count must be greater than zero".into(),
            ));
        }
        Ok(QueueConfig {
            quantum_count,
            event_flag: self.event_flag,
        })
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Allocate an anonymous shareable file of `len` bytes.
///
/// The returned fd is the handle the descriptor carries; ftruncate leaves the
/// contents zero-filled.
pub fn create_shared_fd(len: u64) -> Result<OwnedFd, FmqError> {
    let len = i64::try_from(len)
        .map_err(|_| FmqError::Logic(format!("segment length {} exceeds off_t", len)))?;
    let fd = memfd_create(c"fmq", MemFdCreateFlag::MFD_CLOEXEC).map_err(FmqError::Memory)?;
    ftruncate(&fd, len).map_err(FmqError::Memory)?;
    Ok(fd)
}

/// A mapped view of one shared-memory region.
///
/// `offset` need not be page-aligned; the mapping is widened down to the
/// nearest page boundary and the interior pointer adjusted back. The mapping
/// is released on drop. The fd it was mapped from may be closed afterwards;
/// the kernel keeps the pages alive for the lifetime of the mapping.
pub struct Region {
    base: NonNull<c_void>,
    map_len: usize,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is a fixed view into shared pages. All concurrent access
// through it goes via atomics or is governed by the queue's counter protocol.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn map(fd: BorrowedFd<'_>, offset: u64, len: usize) -> Result<Region, FmqError> {
        if len == 0 {
            return Err(FmqError::Logic("cannot map an empty region".into()));
        }
        let page = page_size() as u64;
        let delta = (offset % page) as usize;
        let map_off = offset - delta as u64;
        let map_len = len
            .checked_add(delta)
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| FmqError::Logic("region length overflow".into()))?;
        // SAFETY: mapping fresh pages; no existing Rust object aliases them.
        let base = unsafe {
            mman::mmap(
                None,
                map_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                map_off as libc::off_t,
            )
        }
        .map_err(FmqError::Memory)?;
        // SAFETY: delta < page <= map_len, so the adjusted pointer stays
        // inside the mapping.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(delta)) };
        Ok(Region {
            base,
            map_len: map_len.get(),
            ptr,
            len,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: base/map_len came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            let _ = mman::munmap(self.base, self.map_len);
        }
    }
}

/// Offsets of the queue regions inside a single backing fd.
///
/// Order matches the descriptor contract: data first, then the read and write
/// counters, then the optional event-flag word. The data region sits at
/// offset zero, which satisfies any element alignment; counters are 8-byte
/// aligned.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentLayout {
    pub data_extent: u64,
    pub read_counter_offset: u64,
    pub write_counter_offset: u64,
    pub event_flag_offset: Option<u64>,
    pub total_len: u64,
}

fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

impl SegmentLayout {
    pub fn compute(
        quantum_count: usize,
        quantum_size: usize,
        event_flag: bool,
    ) -> Result<SegmentLayout, FmqError> {
        let overflow = || FmqError::Logic("shared memory layout overflow".into());
        let data_extent = (quantum_count as u64)
            .checked_mul(quantum_size as u64)
            .ok_or_else(overflow)?;
        let read_counter_offset = align_up(data_extent, 8).ok_or_else(overflow)?;
        let write_counter_offset = read_counter_offset
            .checked_add(COUNTER_EXTENT)
            .ok_or_else(overflow)?;
        let counters_end = write_counter_offset
            .checked_add(COUNTER_EXTENT)
            .ok_or_else(overflow)?;
        let (event_flag_offset, total_len) = if event_flag {
            (
                Some(counters_end),
                counters_end.checked_add(FLAG_EXTENT).ok_or_else(overflow)?,
            )
        } else {
            (None, counters_end)
        };
        Ok(SegmentLayout {
            data_extent,
            read_counter_offset,
            write_counter_offset,
            event_flag_offset,
            total_len,
        })
    }
}
