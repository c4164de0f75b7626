//! Typed error taxonomy for the engine.
//!
//! Every fallible public method returns [`Result<T>`] rather than
//! `anyhow::Result`, so callers can match on failure kind (e.g. treat
//! `NotFound` as a normal miss but `Corrupted` as something to log).
//! `anyhow` is still used inside the CLI inspector and in tests, where a
//! single catch-all error type is the right trade-off.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type returned by every public engine operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Key, or the requested version of a key, is absent or tombstoned.
    #[error("key not found")]
    NotFound,

    /// On-disk or in-flight data failed a structural or checksum check.
    #[error("corrupted data in {fd:?}: {reason}")]
    Corrupted { fd: Option<String>, reason: String },

    /// Underlying storage I/O failure, surfaced verbatim.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine has been closed; no further operations are possible.
    #[error("engine is closed")]
    Closed,

    /// A background worker hit a fatal error; the engine no longer accepts writes.
    #[error("engine is read-only after a background error: {0}")]
    ReadOnly(String),

    /// Caller-supplied argument is invalid (empty key, oversized value, bad option, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Releasing a snapshot or iterator failed; reported but not fatal to the caller.
    #[error("failed to release handle: {0}")]
    Release(String),
}

impl Error {
    pub fn corrupted(fd: impl Into<Option<String>>, reason: impl Into<String>) -> Self {
        Error::Corrupted {
            fd: fd.into(),
            reason: reason.into(),
        }
    }
}
