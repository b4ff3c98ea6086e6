//! Error taxonomy for junknas-core.
//!
//! Kinds, not type names, per spec §7: the adapter returns one of these
//! directly to its caller, with no internal retries.

use thiserror::Error;

/// Main error type for junknas-core operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid path: {reason}")]
    InvalidPath { reason: String },

    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("is a directory: {path}")]
    IsDirectory { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("integrity failure: {reason}")]
    IntegrityFailure { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory: {reason}")]
    OutOfMemory { reason: String },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
}

/// Result type alias for junknas-core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps this error to the POSIX errno the FUSE boundary should reply
    /// with, per the table in spec §6. Kept independent of the `libc` crate
    /// (which is only linked when the `fuse` feature is on) since the
    /// mapping itself is a pure function of the error kind.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidPath { .. } => 22,   // EINVAL
            Error::NotFound { .. } => 2,       // ENOENT
            Error::IsDirectory { .. } => 21,   // EISDIR
            Error::AlreadyExists { .. } => 17, // EEXIST
            Error::QuotaExceeded { .. } => 28, // ENOSPC
            Error::IntegrityFailure { .. } => 5, // EIO
            Error::Io(_) => 5,                 // EIO
            Error::OutOfMemory { .. } => 12,   // ENOMEM
            Error::InvalidState { .. } => 13,  // EACCES
        }
    }
}