//! Operation context: deadline and cancellation for key store calls.
//!
//! Every [`KeyStore`](crate::storage::KeyStore) operation takes an
//! [`OpContext`] and checks it on entry and again immediately before commit.
//! A failed check aborts the transaction, so a cancelled or expired call
//! never leaves a partial mutation behind.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::storage::StorageError;

/// Shared cancellation flag.
///
/// Clones observe the same flag: cancelling one cancels every context
/// holding a clone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every operation holding this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Deadline and cancellation carried through one store operation.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancelToken,
}

impl OpContext {
    /// Context with no deadline and a fresh cancel token.
    pub fn background() -> Self {
        Self::default()
    }

    /// Context that expires `timeout` from now.
    #[allow(clippy::disallowed_methods)]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { deadline: Instant::now().checked_add(timeout), cancel: CancelToken::new() }
    }

    /// Context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline: Some(deadline), cancel: CancelToken::new() }
    }

    /// Replace the cancel token, typically with one shared by a request scope.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// The context's cancel token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail if the context is cancelled or past its deadline.
    ///
    /// Cancellation wins over an expired deadline.
    #[allow(clippy::disallowed_methods)]
    pub fn check(&self) -> Result<(), StorageError> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StorageError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}
