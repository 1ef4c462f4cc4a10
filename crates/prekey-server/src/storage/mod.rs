//! Key store abstraction for prekey bundles
//!
//! Trait-based abstraction for persisting identity keys, signed prekeys and
//! one-time prekey pools. The trait is synchronous (no async) like the rest
//! of the storage layer; async callers move calls onto a blocking thread.
//!
//! # Backends
//!
//! - [`MemoryStorage`]: in-process, for tests and simulation
//! - [`RedbStorage`]: durable, ACID, single process
//! - [`SqliteStorage`]: durable, ACID, shared by several processes
//! - [`ChaoticStorage`]: fault-injection wrapper around either

mod chaotic;
mod error;
mod memory;
mod records;
mod redb;
mod sqlite;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
pub use records::{
    IdentityKey, NewOneTimePreKey, OneTimePreKey, SignedPreKey, SignedPreKeyUpdate, StoredBundle,
};

pub use self::redb::RedbStorage;
pub use self::sqlite::SqliteStorage;
use crate::context::OpContext;

/// Result of a point lookup.
///
/// Absence is an expected outcome, distinct from a storage failure (which
/// arrives as `Err(StorageError)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// Row exists.
    Found(T),
    /// No row for this key.
    NotFound,
}

impl<T> Lookup<T> {
    /// Convert to `Option`.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound => None,
        }
    }

    /// True if a row was found.
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// Map the found value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Found(value) => Lookup::Found(f(value)),
            Self::NotFound => Lookup::NotFound,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::NotFound, Self::Found)
    }
}

/// Result of consuming a one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumption {
    /// The oldest unused key, now marked used.
    Consumed(OneTimePreKey),
    /// The user has no unused one-time prekeys.
    ///
    /// Expected under load; callers fall back to a bundle without a
    /// one-time prekey.
    Exhausted,
}

impl Consumption {
    /// The consumed key, if any.
    pub fn into_option(self) -> Option<OneTimePreKey> {
        match self {
            Self::Consumed(key) => Some(key),
            Self::Exhausted => None,
        }
    }

    /// True if the pool was empty.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

/// Storage abstraction for prekey bundles
///
/// Must be Clone (shared between the bundle service, monitors and request
/// handlers), Send + Sync (thread-safe), and synchronous. Implementations
/// share internal state via Arc, so clones access the same underlying
/// storage. Nothing is cached above this trait: every call reads or writes
/// the backing state.
///
/// Every operation checks `ctx` before doing work and again before commit.
/// A failed check, or any error inside a mutating operation, rolls the
/// operation back completely.
pub trait KeyStore: Clone + Send + Sync + 'static {
    /// Load a user's identity key.
    fn get_identity_key(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<IdentityKey>, StorageError>;

    /// Load a user's current signed prekey.
    fn get_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<SignedPreKey>, StorageError>;

    /// Hand out the user's oldest unused one-time prekey exactly once.
    ///
    /// # Invariants
    ///
    /// - Select and mark-used happen in one transaction
    /// - Concurrent calls for the same user never return the same key
    /// - Concurrent calls for different users do not wait on each other's
    ///   row locks
    /// - Keys are handed out in insertion order (smallest id first)
    /// - Post: on `Consumed(k)`, `k.is_used` is true and the key is never
    ///   returned again
    fn consume_one_time_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Consumption, StorageError>;

    /// Number of unused one-time prekeys for a user.
    ///
    /// Reads persisted state; 0 for unknown users.
    fn count_available_opks(&self, ctx: &OpContext, user_id: &str)
    -> Result<usize, StorageError>;

    /// Alias of [`KeyStore::count_available_opks`].
    fn count_opks(&self, ctx: &OpContext, user_id: &str) -> Result<usize, StorageError> {
        self.count_available_opks(ctx, user_id)
    }

    /// Upsert identity key, signed prekey and initial one-time prekeys.
    ///
    /// # Invariants
    ///
    /// - All or nothing: one transaction
    /// - Existing identity and signed prekey rows are overwritten
    /// - One-time prekeys whose `(user_id, public_key)` already exists are
    ///   skipped
    fn store_bundle(&self, ctx: &OpContext, bundle: &StoredBundle) -> Result<(), StorageError>;

    /// Append one-time prekeys to a user's pool.
    ///
    /// Idempotent: duplicate `(user_id, public_key)` pairs, whether already
    /// stored or repeated within `keys`, are skipped. Returns the number of
    /// rows inserted. All or nothing.
    fn insert_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
        keys: &[NewOneTimePreKey],
        created_at_secs: u64,
    ) -> Result<usize, StorageError>;

    /// Users that have at least one one-time prekey row, used or not.
    ///
    /// Sorted ascending, no duplicates.
    fn list_users_with_opks(&self, ctx: &OpContext) -> Result<Vec<String>, StorageError>;

    /// Replace a user's signed prekey in a single update.
    ///
    /// Returns the new record, or `NotFound` if the user has no signed
    /// prekey to rotate. Identity key and one-time prekeys are untouched.
    /// Readers observe either the old record or the new one, never a mix.
    fn rotate_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
        update: &SignedPreKeyUpdate,
    ) -> Result<Lookup<SignedPreKey>, StorageError>;
}
