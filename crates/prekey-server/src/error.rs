//! Bundle service error types.

use std::fmt;

use prekey_crypto::{EnvelopeError, SignatureError};
use thiserror::Error;

use crate::storage::StorageError;

/// Which long-lived key a lookup was after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Long-term identity key
    Identity,
    /// Current signed prekey
    SignedPreKey,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => f.write_str("identity key"),
            Self::SignedPreKey => f.write_str("signed prekey"),
        }
    }
}

/// Errors from bundle service operations.
///
/// An exhausted one-time prekey pool is not an error; it arrives as
/// [`Consumption::Exhausted`](crate::storage::Consumption::Exhausted).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    /// Sealing or opening a private key failed.
    ///
    /// During registration this aborts the call before anything is stored.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Signed prekey signature did not verify against the identity key.
    #[error("signed prekey rejected: {0}")]
    Signature(#[from] SignatureError),

    /// The user has no such key.
    #[error("{kind} not found for user {user_id}")]
    NotFound {
        /// Key that was looked up
        kind: KeyKind,
        /// User that was looked up
        user_id: String,
    },

    /// Request is malformed (empty ids, empty public keys).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The key store failed.
    ///
    /// Carries the operation and user so callers can log and retry with
    /// context. See [`BundleError::is_retryable`].
    #[error("storage error in {op}: {source}")]
    Storage {
        /// Store operation that failed
        op: &'static str,
        /// User the operation was for, if it was scoped to one
        user_id: Option<String>,
        /// Underlying store failure
        #[source]
        source: StorageError,
    },
}

impl BundleError {
    /// Returns true if retrying the same call may succeed.
    ///
    /// Only transient storage failures qualify. Nothing retries internally.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Adapter for `map_err` that wraps a store failure for `user_id`.
    pub(crate) fn storage(op: &'static str, user_id: &str) -> impl FnOnce(StorageError) -> Self {
        let user_id = user_id.to_string();
        move |source| Self::Storage { op, user_id: Some(user_id), source }
    }
}
