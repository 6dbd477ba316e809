//! Error types for BarDB operations
//!
//! All BarDB errors are represented by the BarError enum, which carries the
//! file offset or path needed to locate the failure.
//!
//! Retryable conditions (a snapshot reclaimed by vacuum, a lost CAS race) are
//! deliberately absent: they are handled inside the engine and never reach
//! the caller.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// BarDB error types with detailed context
#[derive(Debug, Clone)]
pub enum BarError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A node or the header is structurally invalid (bad tag, bad length,
    /// count mismatch, broken ordering)
    Corrupted {
        /// Byte offset of the offending node (0 for the header)
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    ChecksumMismatch {
        /// Byte offset of the node
        offset: u64,
        /// Which checksum failed ("header" or "body")
        region: &'static str,
        /// Checksum stored in the node
        expected: u32,
        /// Checksum computed from the bytes
        actual: u32,
    },

    /// The backing file could not be grown to cover a new allocation
    Allocation {
        /// Offset of the allocation
        offset: u64,
        /// Size of the allocation in bytes
        size: u64,
        /// Description from the underlying call
        message: String,
    },

    /// Value exceeds the largest value a Bigdata node can address
    OversizedEntry {
        /// Size of the oversized value
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
    },

    /// The file exists but carries a foreign identification string
    NoMagicFound {
        /// File being opened
        path: PathBuf,
        /// Identification bytes actually found
        found_bytes: [u8; 8],
    },

    /// Another opener created the file but never finished initialising it
    CreationTimedOut {
        /// File being opened
        path: PathBuf,
        /// How long we waited for the identification string
        waited: Duration,
    },

    /// Options failed validation
    InvalidConfig {
        /// What was wrong
        reason: String,
    },
}

impl BarError {
    pub(crate) fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        BarError::Corrupted { offset, reason: reason.into() }
    }

    pub(crate) fn io_at(path: &std::path::Path, err: std::io::Error, context: &str) -> Self {
        BarError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    /// True for errors that indicate damaged on-disk state rather than a
    /// failing system call.
    pub fn is_corruption(&self) -> bool {
        matches!(self, BarError::Corrupted { .. } | BarError::ChecksumMismatch { .. })
    }
}

impl fmt::Display for BarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            BarError::Corrupted { offset, reason } => {
                write!(f, "Corrupted node at offset {}: {}", offset, reason)
            }

            BarError::ChecksumMismatch { offset, region, expected, actual } => {
                write!(f, "Checksum mismatch in {} of node at offset {}: expected 0x{:08x}, got 0x{:08x}",
                       region, offset, expected, actual)
            }

            BarError::Allocation { offset, size, message } => {
                write!(f, "Unable to allocate {} bytes at offset {}: {}", size, offset, message)
            }

            BarError::OversizedEntry { entry_size, max_size } => {
                write!(f, "Value too large: {} bytes exceeds limit of {} bytes", entry_size, max_size)
            }

            BarError::NoMagicFound { path, found_bytes } => {
                write!(f, "Not a BarDB file: {} starts with {:02x?}", path.display(), found_bytes)
            }

            BarError::CreationTimedOut { path, waited } => {
                write!(f, "Gave up waiting {:?} for {} to finish initialising", waited, path.display())
            }

            BarError::InvalidConfig { reason } => {
                write!(f, "Invalid options: {}", reason)
            }
        }
    }
}

impl Error for BarError {}

/// Convert std::io::Error to BarError::Io
impl From<std::io::Error> for BarError {
    fn from(err: std::io::Error) -> Self {
        BarError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for BarDB operations
pub type BarResult<T> = Result<T, BarError>;
