//! Audit trail for bundle operations.
//!
//! [`BundleService`](crate::BundleService) reports bundle fetches, refills
//! and rejected signed prekey signatures to an [`AuditSink`]. Recording is
//! best effort: a sink error is logged and the operation's own result
//! stands.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// Operation an audit event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// Bundle fetched for an initiator
    GetBundle,
    /// One-time prekeys appended to a pool
    RefillOpks,
    /// Full bundle registered
    RegisterBundle,
    /// Signed prekey replaced
    RotateSignedPreKey,
}

impl AuditAction {
    /// Stable upper-case name, as stored by audit backends.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetBundle => "GET_BUNDLE",
            Self::RefillOpks => "REFILL_OPKS",
            Self::RegisterBundle => "REGISTER_BUNDLE",
            Self::RotateSignedPreKey => "ROTATE_SPK",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    /// Operation completed
    Success,
    /// Operation failed
    Failure,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
        }
    }
}

/// Stage of a bundle fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStep {
    /// Identity key lookup
    IdentityKey,
    /// Signed prekey lookup
    SignedPreKey,
    /// One-time prekey consumption
    OneTimePreKey,
}

impl fmt::Display for BundleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdentityKey => f.write_str("identity_key"),
            Self::SignedPreKey => f.write_str("signed_prekey"),
            Self::OneTimePreKey => f.write_str("one_time_prekey"),
        }
    }
}

/// Action-specific metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDetail {
    /// Nothing beyond action and status
    None,
    /// Fetched bundle; `has_opk` is false when the pool was exhausted
    Bundle {
        /// Whether a one-time prekey was handed out
        has_opk: bool,
    },
    /// Bundle fetch stopped at this step
    FailedStep(BundleStep),
    /// Refill of `num_opks` offered keys
    Refill {
        /// Number of keys in the request
        num_opks: usize,
    },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// What was attempted
    pub action: AuditAction,
    /// How it ended
    pub status: AuditStatus,
    /// User the operation was for
    pub user_id: String,
    /// Human-readable summary
    pub description: &'static str,
    /// Unix timestamp (seconds) from the service clock
    pub timestamp_secs: u64,
    /// Action-specific metadata
    pub detail: AuditDetail,
}

/// Errors from an audit sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    /// The audit backend could not take the record.
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for audit events.
///
/// Called synchronously from service operations, after the operation's
/// outcome is known. Implementations must not block for long; errors are
/// logged by the caller and otherwise ignored.
pub trait AuditSink: Send + Sync + 'static {
    /// Record one event.
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAudit;

impl AuditSink for NoAudit {
    fn record(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        (**self).record(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_stored_audit_vocabulary() {
        assert_eq!(AuditAction::GetBundle.to_string(), "GET_BUNDLE");
        assert_eq!(AuditAction::RotateSignedPreKey.to_string(), "ROTATE_SPK");
        assert_eq!(AuditStatus::Failure.to_string(), "failure");
        assert_eq!(BundleStep::OneTimePreKey.to_string(), "one_time_prekey");
    }

    #[test]
    fn shared_sink_forwards() {
        let sink: Arc<dyn AuditSink> = Arc::new(NoAudit);
        let event = AuditEvent {
            action: AuditAction::RefillOpks,
            status: AuditStatus::Success,
            user_id: "u".to_string(),
            description: "Refilled OPKs",
            timestamp_secs: 1,
            detail: AuditDetail::Refill { num_opks: 3 },
        };

        assert_eq!(sink.record(&event), Ok(()));
    }
}
