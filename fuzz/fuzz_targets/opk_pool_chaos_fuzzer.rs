//! Fuzz target for one-time prekey pools under storage failures
//!
//! Drives the bundle service over `ChaoticStorage` with arbitrary
//! registrations, refills, fetches and rotations.
//!
//! # Strategy
//!
//! - Variable failure rates (0% to 90%)
//! - Several users sharing one store
//! - Refills that repeat public keys already uploaded or consumed
//!
//! # Invariants
//!
//! - The service NEVER panics on storage errors
//! - A one-time prekey is never handed out twice
//! - Each user's available count equals successful inserts minus
//!   consumptions
//! - Exhaustion only happens when a user's pool is really empty

#![no_main]

use std::collections::{HashMap, HashSet};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use prekey_crypto::KeyEnvelope;
use prekey_server::{
    BundleError, BundleService, ChaoticStorage, Consumption, KeyStore, ManualClock,
    MemoryStorage, OneTimePreKeyUpload, OpContext, RegisterBundle, RotateSignedPreKey,
    ServiceConfig,
};

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    operations: Vec<PoolOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum PoolOperation {
    Register { user: u8, keys: Vec<u8> },
    Refill { user: u8, keys: Vec<u8> },
    Consume { user: u8 },
    FetchBundle { user: u8 },
    Rotate { user: u8 },
}

fn user_id(user: u8) -> String {
    format!("user-{}", user % 4)
}

fn uploads(user: &str, keys: &[u8]) -> Vec<OneTimePreKeyUpload> {
    keys.iter()
        .take(16)
        .map(|k| OneTimePreKeyUpload::public(format!("k{k}"), format!("{user}-{k}")))
        .collect()
}

#[derive(Default)]
struct Pool {
    uploaded: HashSet<String>,
    consumed: HashSet<u64>,
}

impl Pool {
    /// Public keys not yet stored for this user.
    fn fresh(&self, keys: &[OneTimePreKeyUpload]) -> HashSet<String> {
        keys.iter()
            .map(|key| key.public_key.clone())
            .filter(|public| !self.uploaded.contains(public))
            .collect()
    }

    fn available(&self) -> usize {
        self.uploaded.len() - self.consumed.len()
    }

    fn record_consumption(&mut self, consumption: Consumption) {
        match consumption {
            Consumption::Consumed(key) => {
                assert!(self.consumed.insert(key.id), "one-time prekey handed out twice");
            },
            Consumption::Exhausted => assert_eq!(self.available(), 0, "exhausted with keys left"),
        }
    }
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let storage =
        ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, scenario.chaos_seed);

    let service = BundleService::new(
        storage.clone(),
        KeyEnvelope::new(&[0x5A; 32]).expect("32-byte key is valid"),
        ManualClock::new(1_000),
        ServiceConfig { verify_signatures: false, ..ServiceConfig::default() },
    );
    let ctx = OpContext::background();
    let mut pools: HashMap<String, Pool> = HashMap::new();

    for op in scenario.operations.into_iter().take(64) {
        match op {
            PoolOperation::Register { user, keys } => {
                let user = user_id(user);
                let one_time_prekeys = uploads(&user, &keys);
                let pool = pools.entry(user.clone()).or_default();
                let fresh = pool.fresh(&one_time_prekeys);

                let request = RegisterBundle {
                    user_id: user,
                    identity_public_key: "IK".to_string(),
                    identity_private_key: None,
                    signed_prekey_public_key: "SPK".to_string(),
                    signed_prekey_private_key: None,
                    signed_prekey_signature: "SIG".to_string(),
                    signed_prekey_expires_at_secs: None,
                    one_time_prekeys,
                };

                match service.register_bundle(&ctx, request) {
                    Ok(()) => pool.uploaded.extend(fresh),
                    Err(BundleError::Storage { .. }) => {},
                    Err(e) => panic!("unexpected registration error: {e}"),
                }
            },
            PoolOperation::Refill { user, keys } => {
                let user = user_id(user);
                let keys = uploads(&user, &keys);
                let pool = pools.entry(user.clone()).or_default();
                let fresh = pool.fresh(&keys);

                match service.refill_opks(&ctx, &user, &keys) {
                    Ok(inserted) => {
                        assert_eq!(inserted, fresh.len());
                        pool.uploaded.extend(fresh);
                    },
                    Err(BundleError::Storage { .. }) => {},
                    Err(e) => panic!("unexpected refill error: {e}"),
                }
            },
            PoolOperation::Consume { user } => {
                let user = user_id(user);
                let pool = pools.entry(user.clone()).or_default();

                match service.consume_one_time_prekey(&ctx, &user) {
                    Ok(consumption) => pool.record_consumption(consumption),
                    Err(BundleError::Storage { .. }) => {},
                    Err(e) => panic!("unexpected consume error: {e}"),
                }
            },
            PoolOperation::FetchBundle { user } => {
                let user = user_id(user);
                let pool = pools.entry(user.clone()).or_default();

                match service.fetch_bundle(&ctx, &user) {
                    Ok(bundle) => match bundle.one_time_prekey {
                        Some(key) => {
                            let first_time = pool.consumed.insert(key.id);
                            assert!(first_time, "one-time prekey handed out twice");
                        },
                        None => assert_eq!(pool.available(), 0, "exhausted with keys left"),
                    },
                    Err(BundleError::Storage { .. } | BundleError::NotFound { .. }) => {},
                    Err(e) => panic!("unexpected fetch error: {e}"),
                }
            },
            PoolOperation::Rotate { user } => {
                let request = RotateSignedPreKey {
                    public_key: "SPK-next".to_string(),
                    private_key: None,
                    signature: "SIG-next".to_string(),
                    expires_at_secs: None,
                };

                match service.rotate_signed_prekey(&ctx, &user_id(user), request) {
                    Ok(_) | Err(BundleError::Storage { .. } | BundleError::NotFound { .. }) => {},
                    Err(e) => panic!("unexpected rotation error: {e}"),
                }
            },
        }
    }

    // ORACLE: the inner store agrees with every successful call
    for (user, pool) in &pools {
        let available =
            storage.inner().count_available_opks(&ctx, user).expect("inner store works");
        assert_eq!(available, pool.available(), "pool drift for {user}");
    }
});
