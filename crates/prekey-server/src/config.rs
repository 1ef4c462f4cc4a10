//! Bundle service configuration.

use std::time::Duration;

use crate::context::OpContext;

/// Tunables for [`BundleService`](crate::BundleService) and
/// [`OpkMonitor`](crate::OpkMonitor).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Verify signed prekey signatures against the identity key on
    /// registration and rotation
    pub verify_signatures: bool,
    /// Users with fewer unused one-time prekeys than this are reported low
    pub low_watermark: usize,
    /// Time between monitor scans
    pub monitor_interval: Duration,
    /// Deadline applied to each store operation started via
    /// [`ServiceConfig::op_context`]
    pub op_timeout: Duration,
}

impl ServiceConfig {
    /// Fresh operation context expiring after `op_timeout`.
    pub fn op_context(&self) -> OpContext {
        OpContext::with_timeout(self.op_timeout)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            verify_signatures: true,
            low_watermark: 10,
            monitor_interval: Duration::from_secs(60),
            op_timeout: Duration::from_secs(5),
        }
    }
}
