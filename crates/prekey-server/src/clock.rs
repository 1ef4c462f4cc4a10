//! Wall-clock source for record timestamps.
//!
//! Stores never read the clock themselves: the bundle service stamps records
//! with [`Clock::wall_clock_secs`] before handing them to storage. This keeps
//! storage deterministic and lets tests pin time with [`ManualClock`].

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Source of Unix timestamps in seconds.
///
/// # Invariants
///
/// - Production implementations return real wall-clock time
/// - Values are only used for record metadata and expiry; ordering of
///   one-time prekeys never depends on them
pub trait Clock: Clone + Send + Sync + 'static {
    /// Seconds since the Unix epoch.
    fn wall_clock_secs(&self) -> u64;
}

/// Production clock backed by `SystemTime`.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a system clock.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    /// Returns 0 if the system clock is set before the Unix epoch.
    #[allow(clippy::disallowed_methods)]
    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}

/// Manually driven clock for tests and simulation.
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    secs: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock reading `secs`.
    pub fn new(secs: u64) -> Self {
        Self { secs: Arc::new(AtomicU64::new(secs)) }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }

    /// Set the clock to `secs`.
    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn wall_clock_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}
