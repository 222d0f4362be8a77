//! The serializable handle that lets a peer process attach to a queue.
//!
//! A descriptor is a small table of [`Grantor`] records, one per shared
//! region, plus the file descriptors they index into. The byte format is
//! fixed little-endian; the fds travel out-of-band next to the blob (a
//! transport that can carry fds, a socket with SCM_RIGHTS, hands them over
//! separately).

use std::os::fd::OwnedFd;

use crate::core::{COUNTER_EXTENT, FLAG_EXTENT};
use crate::errors::FmqError;

/// Wire format version emitted by [`GrantorDescriptor::serialize`].
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Grantor flag bit: this region is the event-flag word.
pub const GRANTOR_FLAG_EVENT_WORD: u32 = 1 << 0;

const GRANTOR_DATA: usize = 0;
const GRANTOR_READ_COUNTER: usize = 1;
const GRANTOR_WRITE_COUNTER: usize = 2;
const GRANTOR_EVENT_FLAG: usize = 3;

/// One shared-memory region: which handle it lives in and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grantor {
    pub flags: u32,
    pub fd_index: u32,
    pub offset: u64,
    pub extent: u64,
}

impl Grantor {
    fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.extent)
    }
}

/// Serializable manifest of a queue's shared regions.
///
/// Grantor order is fixed: data region, read counter, write counter, then
/// the event-flag word if the queue has one. A descriptor owns its handles;
/// [`GrantorDescriptor::try_clone`] duplicates them so the same queue can be
/// offered to several readers (Unsynchronized flavor).
#[derive(Debug)]
pub struct GrantorDescriptor {
    grantors: Vec<Grantor>,
    handles: Vec<OwnedFd>,
}

impl GrantorDescriptor {
    pub fn new(grantors: Vec<Grantor>, handles: Vec<OwnedFd>) -> Result<Self, FmqError> {
        validate(&grantors, handles.len())?;
        Ok(GrantorDescriptor { grantors, handles })
    }

    /// Flatten the grantor table into its wire form.
    ///
    /// The blob carries everything except the handles themselves; callers
    /// send those alongside via their fd-capable transport.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + 24 * self.grantors.len());
        out.extend_from_slice(&DESCRIPTOR_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.grantors.len() as u32).to_le_bytes());
        for grantor in &self.grantors {
            out.extend_from_slice(&grantor.flags.to_le_bytes());
            out.extend_from_slice(&grantor.fd_index.to_le_bytes());
            out.extend_from_slice(&grantor.offset.to_le_bytes());
            out.extend_from_slice(&grantor.extent.to_le_bytes());
        }
        out.extend_from_slice(&(self.handles.len() as u32).to_le_bytes());
        out
    }

    /// Rebuild a descriptor from a received blob and the handles that came
    /// with it.
    pub fn deserialize(bytes: &[u8], handles: Vec<OwnedFd>) -> Result<Self, FmqError> {
        let mut cursor = bytes;
        let version = take_u32(&mut cursor)?;
        if version != DESCRIPTOR_VERSION {
            return Err(FmqError::MalformedDescriptor(format!(
                "unsupported descriptor version {}",
                version
            )));
        }
        let num_grantors = take_u32(&mut cursor)? as usize;
        if num_grantors != 3 && num_grantors != 4 {
            return Err(FmqError::MalformedDescriptor(format!(
                "expected 3 or 4 grantors, found {}",
                num_grantors
            )));
        }
        let mut grantors = Vec::with_capacity(num_grantors);
        for _ in 0..num_grantors {
            grantors.push(Grantor {
                flags: take_u32(&mut cursor)?,
                fd_index: take_u32(&mut cursor)?,
                offset: take_u64(&mut cursor)?,
                extent: take_u64(&mut cursor)?,
            });
        }
        let num_handles = take_u32(&mut cursor)? as usize;
        if !cursor.is_empty() {
            return Err(FmqError::MalformedDescriptor(format!(
                "{} trailing bytes after descriptor",
                cursor.len()
            )));
        }
        if num_handles != handles.len() {
            return Err(FmqError::MalformedDescriptor(format!(
                "descriptor names {} handles but {} were supplied",
                num_handles,
                handles.len()
            )));
        }
        Self::new(grantors, handles)
    }

    /// Duplicate the descriptor, dup-ing every handle.
    pub fn try_clone(&self) -> Result<Self, FmqError> {
        let handles = self
            .handles
            .iter()
            .map(|fd| fd.try_clone())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GrantorDescriptor {
            grantors: self.grantors.clone(),
            handles,
        })
    }

    pub fn grantors(&self) -> &[Grantor] {
        &self.grantors
    }

    pub fn handles(&self) -> &[OwnedFd] {
        &self.handles
    }

    pub(crate) fn data(&self) -> &Grantor {
        &self.grantors[GRANTOR_DATA]
    }

    pub(crate) fn read_counter(&self) -> &Grantor {
        &self.grantors[GRANTOR_READ_COUNTER]
    }

    pub(crate) fn write_counter(&self) -> &Grantor {
        &self.grantors[GRANTOR_WRITE_COUNTER]
    }

    pub(crate) fn event_flag(&self) -> Option<&Grantor> {
        self.grantors.get(GRANTOR_EVENT_FLAG)
    }
}

fn take_u32(bytes: &mut &[u8]) -> Result<u32, FmqError> {
    let (head, rest) = bytes
        .split_first_chunk::<4>()
        .ok_or_else(|| FmqError::MalformedDescriptor("truncated descriptor".into()))?;
    *bytes = rest;
    Ok(u32::from_le_bytes(*head))
}

fn take_u64(bytes: &mut &[u8]) -> Result<u64, FmqError> {
    let (head, rest) = bytes
        .split_first_chunk::<8>()
        .ok_or_else(|| FmqError::MalformedDescriptor("truncated descriptor".into()))?;
    *bytes = rest;
    Ok(u64::from_le_bytes(*head))
}

fn validate(grantors: &[Grantor], num_handles: usize) -> Result<(), FmqError> {
    if grantors.len() != 3 && grantors.len() != 4 {
        return Err(FmqError::MalformedDescriptor(format!(
            "expected 3 or 4 grantors, found {}",
            grantors.len()
        )));
    }
    for (index, grantor) in grantors.iter().enumerate() {
        if grantor.fd_index as usize >= num_handles {
            return Err(FmqError::MalformedDescriptor(format!(
                "grantor {} references handle {} of {}",
                index, grantor.fd_index, num_handles
            )));
        }
        if grantor.end().is_none() {
            return Err(FmqError::MalformedDescriptor(format!(
                "grantor {} extent overflows",
                index
            )));
        }
        let is_flag_word = grantor.flags & GRANTOR_FLAG_EVENT_WORD != 0;
        if is_flag_word != (index == GRANTOR_EVENT_FLAG) {
            return Err(FmqError::MalformedDescriptor(format!(
                "event-flag marker on grantor {}",
                index
            )));
        }
    }
    if grantors[GRANTOR_DATA].extent == 0 {
        return Err(FmqError::MalformedDescriptor("empty data region".into()));
    }
    for index in [GRANTOR_READ_COUNTER, GRANTOR_WRITE_COUNTER] {
        let grantor = &grantors[index];
        if grantor.offset % 8 != 0 || grantor.extent < COUNTER_EXTENT {
            return Err(FmqError::MalformedDescriptor(format!(
                "counter grantor {} is misaligned or short",
                index
            )));
        }
    }
    if let Some(grantor) = grantors.get(GRANTOR_EVENT_FLAG) {
        if grantor.offset % 4 != 0 || grantor.extent < FLAG_EXTENT {
            return Err(FmqError::MalformedDescriptor(
                "event-flag grantor is misaligned or short".into(),
            ));
        }
    }
    // Regions sharing an fd must not overlap.
    for (i, a) in grantors.iter().enumerate() {
        for b in grantors.iter().skip(i + 1) {
            if a.fd_index != b.fd_index {
                continue;
            }
            // end() checked above.
            let a_end = a.end().unwrap_or(u64::MAX);
            let b_end = b.end().unwrap_or(u64::MAX);
            if a.offset < b_end && b.offset < a_end {
                return Err(FmqError::MalformedDescriptor(format!(
                    "regions [{}, {}) and [{}, {}) overlap",
                    a.offset, a_end, b.offset, b_end
                )));
            }
        }
    }
    Ok(())
}
