//! Chaotic storage wrapper for fault injection testing
//!
//! Wraps any [`KeyStore`] and fails operations at random, before they reach
//! the inner store. Chaos tests use it to check that failed calls leave no
//! partial state and that callers surface the failure instead of guessing.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use super::{
    Consumption, IdentityKey, KeyStore, Lookup, NewOneTimePreKey, SignedPreKey,
    SignedPreKeyUpdate, StorageError, StoredBundle,
};
use crate::context::OpContext;

/// Chaotic storage wrapper that randomly injects failures
///
/// Injected failures are `StorageError::Io` and happen before delegation, so
/// the inner store is never touched by a failed call.
#[derive(Clone)]
pub struct ChaoticStorage<S: KeyStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
}

/// Linear congruential generator, so chaos runs replay from a seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    #[allow(clippy::cast_precision_loss)]
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: KeyStore> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    #[allow(clippy::panic)]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted, failed or not.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Count the operation and decide whether to fail it.
    fn inject(&self, op: &str) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        // A poisoned RNG is itself a fault; keep failing rather than panic
        let fail = match self.rng.lock() {
            Ok(mut rng) => rng.next() < self.failure_rate,
            Err(_) => true,
        };

        if fail {
            tracing::debug!(op, "injecting storage failure");
            return Err(StorageError::Io(format!("chaotic failure injection: {op}")));
        }

        Ok(())
    }
}

impl<S: KeyStore> KeyStore for ChaoticStorage<S> {
    fn get_identity_key(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<IdentityKey>, StorageError> {
        self.inject("get_identity_key")?;
        self.inner.get_identity_key(ctx, user_id)
    }

    fn get_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<SignedPreKey>, StorageError> {
        self.inject("get_signed_prekey")?;
        self.inner.get_signed_prekey(ctx, user_id)
    }

    fn consume_one_time_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Consumption, StorageError> {
        self.inject("consume_one_time_prekey")?;
        self.inner.consume_one_time_prekey(ctx, user_id)
    }

    fn count_available_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<usize, StorageError> {
        self.inject("count_available_opks")?;
        self.inner.count_available_opks(ctx, user_id)
    }

    fn store_bundle(&self, ctx: &OpContext, bundle: &StoredBundle) -> Result<(), StorageError> {
        self.inject("store_bundle")?;
        self.inner.store_bundle(ctx, bundle)
    }

    fn insert_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
        keys: &[NewOneTimePreKey],
        created_at_secs: u64,
    ) -> Result<usize, StorageError> {
        self.inject("insert_opks")?;
        self.inner.insert_opks(ctx, user_id, keys, created_at_secs)
    }

    fn list_users_with_opks(&self, ctx: &OpContext) -> Result<Vec<String>, StorageError> {
        self.inject("list_users_with_opks")?;
        self.inner.list_users_with_opks(ctx)
    }

    fn rotate_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
        update: &SignedPreKeyUpdate,
    ) -> Result<Lookup<SignedPreKey>, StorageError> {
        self.inject("rotate_signed_prekey")?;
        self.inner.rotate_signed_prekey(ctx, user_id, update)
    }
}
