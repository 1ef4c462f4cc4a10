//! One-time prekey pool monitor.
//!
//! Periodically lists users that have uploaded one-time prekeys and reports
//! the ones whose unused count fell below a threshold, so clients can be
//! asked to refill. The monitor only reads; it never mutates the store.

use std::time::Duration;

use tokio::{sync::watch, time::MissedTickBehavior};

use crate::{
    config::ServiceConfig,
    context::OpContext,
    storage::{KeyStore, StorageError},
};

/// A user whose one-time prekey pool is below the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowPool {
    /// User with a low pool.
    pub user_id: String,
    /// Unused one-time prekeys left.
    pub available: usize,
}

/// Counters from a finished [`OpkMonitor::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Scans started.
    pub scans: u64,
    /// Scans that failed as a whole (listing failed or the task died).
    pub failures: u64,
}

/// Periodic scanner for low one-time prekey pools.
#[derive(Clone)]
pub struct OpkMonitor<S: KeyStore> {
    store: S,
    threshold: usize,
    interval: Duration,
    op_timeout: Duration,
}

impl<S: KeyStore> OpkMonitor<S> {
    /// Monitor reporting users with fewer than `threshold` unused keys every
    /// `interval`.
    pub fn new(store: S, threshold: usize, interval: Duration) -> Self {
        Self { store, threshold, interval, op_timeout: ServiceConfig::default().op_timeout }
    }

    /// Monitor using the watermark, interval and timeout from `config`.
    pub fn from_config(store: S, config: &ServiceConfig) -> Self {
        Self {
            store,
            threshold: config.low_watermark,
            interval: config.monitor_interval,
            op_timeout: config.op_timeout,
        }
    }

    /// Reporting threshold.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// One pass over all users with one-time prekeys.
    ///
    /// A failed count for one user is logged and that user skipped.
    ///
    /// # Errors
    ///
    /// Returns the store error if listing users fails.
    pub fn scan(&self, ctx: &OpContext) -> Result<Vec<LowPool>, StorageError> {
        scan_store(&self.store, ctx, self.threshold)
    }

    /// Scan every `interval` until `shutdown` becomes true or its sender is
    /// dropped.
    ///
    /// The first scan runs immediately. Scans run on the blocking pool, each
    /// under its own deadline.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> MonitorStats {
        let mut stats = MonitorStats::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            threshold = self.threshold,
            interval_ms = self.interval.as_millis() as u64,
            "one-time prekey monitor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {},
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                },
            }

            stats.scans += 1;

            let store = self.store.clone();
            let threshold = self.threshold;
            let ctx = OpContext::with_timeout(self.op_timeout);
            let scan = tokio::task::spawn_blocking(move || scan_store(&store, &ctx, threshold));

            match scan.await {
                Ok(Ok(low)) => {
                    for pool in &low {
                        tracing::warn!(
                            user_id = %pool.user_id,
                            available = pool.available,
                            threshold,
                            "one-time prekey pool low"
                        );
                    }
                    tracing::debug!(low = low.len(), "monitor scan complete");
                },
                Ok(Err(e)) => {
                    stats.failures += 1;
                    tracing::warn!(error = %e, "monitor scan failed");
                },
                Err(e) => {
                    stats.failures += 1;
                    tracing::warn!(error = %e, "monitor scan task failed");
                },
            }
        }

        tracing::info!(
            scans = stats.scans,
            failures = stats.failures,
            "one-time prekey monitor stopped"
        );
        stats
    }
}

fn scan_store<S: KeyStore>(
    store: &S,
    ctx: &OpContext,
    threshold: usize,
) -> Result<Vec<LowPool>, StorageError> {
    let users = store.list_users_with_opks(ctx)?;

    let mut low = Vec::new();
    for user_id in users {
        match store.count_available_opks(ctx, &user_id) {
            Ok(available) if available < threshold => low.push(LowPool { user_id, available }),
            Ok(_) => {},
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "skipping user: count failed");
            },
        }
    }

    Ok(low)
}
