//! Storage error types.
//!
//! Defines errors that can occur during key store operations:
//! - `Transaction`: begin/commit/abort of a storage transaction failed
//! - `Constraint`: a uniqueness or referential rule was violated unexpectedly
//! - `Serialization`: failed to encode/decode a stored record
//! - `Io`: underlying storage system errors
//! - `Locked`: another process holds the store exclusively
//! - `Cancelled` / `DeadlineExceeded`: the operation context gave up
//!
//! "Not found" and "no one-time prekeys left" are not errors; they are
//! reported through [`Lookup`](super::Lookup) and
//! [`Consumption`](super::Consumption).

use thiserror::Error;

/// Errors that can occur during key store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Transaction could not be started, committed or aborted
    ///
    /// Nothing from the failed transaction is visible to later reads.
    #[error("transaction failure: {0}")]
    Transaction(String),

    /// Unexpected constraint violation
    ///
    /// Duplicate one-time prekeys are skipped silently and never produce
    /// this error. It indicates an index that disagrees with its table or an
    /// exhausted row id space.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, poisoned lock, etc.)
    #[error("I/O error: {0}")]
    Io(String),

    /// Store file is held exclusively by another process
    ///
    /// Only backends that cannot share a file between processes (redb)
    /// return this, and only from `open`.
    #[error("store is locked by another process: {0}")]
    Locked(String),

    /// Operation context was cancelled before commit
    #[error("operation cancelled")]
    Cancelled,

    /// Operation context deadline passed before commit
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

impl StorageError {
    /// Returns true if retrying the same operation may succeed.
    ///
    /// Retry policy belongs to callers; the store never retries internally.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transaction(_) | Self::Io(_) | Self::DeadlineExceeded => true,
            Self::Constraint(_) | Self::Serialization(_) | Self::Locked(_) | Self::Cancelled => {
                false
            },
        }
    }
}
