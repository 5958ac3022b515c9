//! Error types for KestrelKV
//!
//! Provides a unified error type for all operations.
//!
//! Every fallible call reports its outcome synchronously; nothing in this
//! crate retries on the caller's behalf. A cursor that is no longer valid
//! must still be status-checked, since invalidity can mean either clean
//! exhaustion or a swallowed child error.

use thiserror::Error;

/// Result type alias using KestrelError
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Unified error type for KestrelKV operations
///
/// `Clone` so that iterators can retain the first error they observe and
/// hand it back from every later `status()` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KestrelError {
    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("Not found")]
    NotFound,

    /// More merge operands may exist below the sources consulted so far.
    #[error("Merge in progress")]
    MergeInProgress,

    // -------------------------------------------------------------------------
    // Data Errors
    // -------------------------------------------------------------------------
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // API Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Resource limit hit part way through a batched read.
    #[error("Aborted: {0}")]
    Aborted(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    /// Lost a race on a unique `(key, seq)` insert; retry with a fresh sequence.
    #[error("Try again: {0}")]
    TryAgain(String),

    /// Snapshot validation found a newer write to a key being locked.
    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Timed out waiting for lock")]
    LockTimeout,

    #[error("Deadlock detected")]
    Deadlock,

    /// Transaction outlived its expiration or had its locks stolen.
    #[error("Transaction expired")]
    Expired,
}

impl KestrelError {
    /// Shorthand for building a `Corruption` error
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        KestrelError::Corruption(msg.into())
    }

    /// Shorthand for building an `InvalidArgument` error
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        KestrelError::InvalidArgument(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KestrelError::NotFound)
    }

    pub fn is_try_again(&self) -> bool {
        matches!(self, KestrelError::TryAgain(_))
    }
}

impl From<bincode::Error> for KestrelError {
    fn from(e: bincode::Error) -> Self {
        KestrelError::Serialization(e.to_string())
    }
}
