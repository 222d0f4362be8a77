use std::{fmt, io};

use nix::errno::Errno;

/// Error type for queue construction and descriptor handling.
///
/// The data-path operations (`read`, `write` and their blocking forms) report
/// success as a plain `bool`; only construction, descriptor serialization and
/// the event-flag facility surface structured errors.
#[derive(Debug)]
pub enum FmqError {
    /// A descriptor failed validation during deserialize or construction.
    MalformedDescriptor(String),
    /// Allocating or mapping shared memory failed (memfd_create, ftruncate,
    /// mmap).
    Memory(Errno),
    /// The kernel wait primitive returned an unexpected error.
    Futex(Errno),
    /// A blocking wait reached its deadline.
    Timeout,
    /// Duplicating descriptor handles failed.
    Io(io::Error),
    /// Internal invariant violation (layout overflow, zero-sized element).
    Logic(String),
}

impl fmt::Display for FmqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FmqError::MalformedDescriptor(msg) => write!(f, "malformed descriptor: {}", msg),
            FmqError::Memory(e) => write!(f, "shared memory error: {}", e),
            FmqError::Futex(e) => write!(f, "futex error: {}", e),
            FmqError::Timeout => write!(f, "wait timed out"),
            FmqError::Io(e) => write!(f, "I/O error: {}", e),
            FmqError::Logic(msg) => write!(f, "logic error: {}", msg),
        }
    }
}

impl std::error::Error for FmqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FmqError::MalformedDescriptor(_) => None,
            FmqError::Memory(e) => Some(e),
            FmqError::Futex(e) => Some(e),
            FmqError::Timeout => None,
            FmqError::Io(e) => Some(e),
            FmqError::Logic(_) => None,
        }
    }
}

// Errno can come from either the memory or the futex path, so conversions at
// the call sites use explicit map_err; only the unambiguous io::Error gets a
// From impl.
impl From<io::Error> for FmqError {
    fn from(err: io::Error) -> Self {
        FmqError::Io(err)
    }
}
