#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use super::{
    Consumption, IdentityKey, KeyStore, Lookup, NewOneTimePreKey, OneTimePreKey, SignedPreKey,
    SignedPreKeyUpdate, StorageError, StoredBundle,
};
use crate::context::OpContext;

/// In-memory storage implementation for testing and simulation
///
/// Each user's keys sit behind their own `Mutex`, and the user map behind a
/// `RwLock` that is only write-locked to add a new user. Consuming a key for
/// one user therefore never waits on another user's lock, mirroring row-level
/// locking in a relational store.
///
/// Mutations are staged on a copy of the user's keys and swapped in by an
/// explicit commit; an early return or a failed context check discards the
/// copy. A poisoned lock surfaces as `StorageError::Io` instead of a panic.
#[derive(Clone)]
pub struct MemoryStorage {
    users: Arc<RwLock<HashMap<String, Arc<Mutex<UserKeys>>>>>,
    /// Row id source shared by all users, so ids are globally unique
    next_opk_id: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Default)]
struct UserKeys {
    identity: Option<IdentityKey>,
    signed_prekey: Option<SignedPreKey>,
    /// Ordered by id (insertion order)
    one_time_prekeys: Vec<OneTimePreKey>,
}

impl UserKeys {
    fn available(&self) -> usize {
        self.one_time_prekeys.iter().filter(|key| !key.is_used).count()
    }

    /// Append keys, skipping public keys this user already has.
    ///
    /// Ids are drawn while the caller holds this user's lock, so per-user id
    /// order matches insertion order.
    fn append_opks(
        &mut self,
        user_id: &str,
        keys: &[NewOneTimePreKey],
        created_at_secs: u64,
        ids: &AtomicU64,
    ) -> Result<usize, StorageError> {
        let mut seen: HashSet<String> =
            self.one_time_prekeys.iter().map(|key| key.public_key.clone()).collect();

        let mut inserted = 0;
        for key in keys {
            if !seen.insert(key.public_key.clone()) {
                continue;
            }

            let id = ids.fetch_add(1, Ordering::SeqCst);
            if id == u64::MAX {
                return Err(StorageError::Constraint("one-time prekey id space exhausted".into()));
            }

            self.one_time_prekeys.push(key.clone().into_record(id, user_id, created_at_secs));
            inserted += 1;
        }

        debug_assert!(self.one_time_prekeys.windows(2).all(|w| w[0].id < w[1].id));
        Ok(inserted)
    }
}

/// Staged write on one user's keys.
///
/// Holds the user's lock for its whole lifetime. Mutations go to `staged`;
/// [`UserTxn::commit`] swaps them in. Dropping without commit discards them.
struct UserTxn<'a> {
    guard: MutexGuard<'a, UserKeys>,
    staged: UserKeys,
}

impl<'a> UserTxn<'a> {
    fn begin(guard: MutexGuard<'a, UserKeys>) -> Self {
        let staged = guard.clone();
        Self { guard, staged }
    }

    fn commit(mut self, ctx: &OpContext) -> Result<(), StorageError> {
        ctx.check()?;
        *self.guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StorageError {
    StorageError::Io("memory storage lock poisoned".to_string())
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            next_opk_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of one-time prekey rows for a user, used or not.
    ///
    /// Useful for debugging and testing.
    pub fn opk_row_count(&self, user_id: &str) -> Result<usize, StorageError> {
        match self.user(user_id)? {
            Some(slot) => Ok(slot.lock().map_err(poisoned)?.one_time_prekeys.len()),
            None => Ok(0),
        }
    }

    fn user(&self, user_id: &str) -> Result<Option<Arc<Mutex<UserKeys>>>, StorageError> {
        Ok(self.users.read().map_err(poisoned)?.get(user_id).cloned())
    }

    fn user_or_insert(&self, user_id: &str) -> Result<Arc<Mutex<UserKeys>>, StorageError> {
        if let Some(slot) = self.user(user_id)? {
            return Ok(slot);
        }

        let mut users = self.users.write().map_err(poisoned)?;
        Ok(Arc::clone(users.entry(user_id.to_string()).or_default()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryStorage {
    fn get_identity_key(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<IdentityKey>, StorageError> {
        ctx.check()?;
        let Some(slot) = self.user(user_id)? else {
            return Ok(Lookup::NotFound);
        };

        let keys = slot.lock().map_err(poisoned)?;
        Ok(keys.identity.clone().into())
    }

    fn get_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<SignedPreKey>, StorageError> {
        ctx.check()?;
        let Some(slot) = self.user(user_id)? else {
            return Ok(Lookup::NotFound);
        };

        let keys = slot.lock().map_err(poisoned)?;
        Ok(keys.signed_prekey.clone().into())
    }

    fn consume_one_time_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Consumption, StorageError> {
        ctx.check()?;
        let Some(slot) = self.user(user_id)? else {
            return Ok(Consumption::Exhausted);
        };

        let mut txn = UserTxn::begin(slot.lock().map_err(poisoned)?);

        let Some(key) = txn.staged.one_time_prekeys.iter_mut().find(|key| !key.is_used) else {
            return Ok(Consumption::Exhausted);
        };
        key.is_used = true;
        let consumed = key.clone();

        txn.commit(ctx)?;
        Ok(Consumption::Consumed(consumed))
    }

    fn count_available_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<usize, StorageError> {
        ctx.check()?;
        match self.user(user_id)? {
            Some(slot) => Ok(slot.lock().map_err(poisoned)?.available()),
            None => Ok(0),
        }
    }

    fn store_bundle(&self, ctx: &OpContext, bundle: &StoredBundle) -> Result<(), StorageError> {
        ctx.check()?;
        let slot = self.user_or_insert(&bundle.user_id)?;
        let mut txn = UserTxn::begin(slot.lock().map_err(poisoned)?);

        txn.staged.identity = Some(bundle.identity_key());
        txn.staged.signed_prekey =
            Some(SignedPreKey::from_update(&bundle.user_id, &bundle.signed_prekey));
        txn.staged.append_opks(
            &bundle.user_id,
            &bundle.one_time_prekeys,
            bundle.created_at_secs,
            &self.next_opk_id,
        )?;

        txn.commit(ctx)
    }

    fn insert_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
        keys: &[NewOneTimePreKey],
        created_at_secs: u64,
    ) -> Result<usize, StorageError> {
        ctx.check()?;
        let slot = self.user_or_insert(user_id)?;
        let mut txn = UserTxn::begin(slot.lock().map_err(poisoned)?);

        let inserted = txn.staged.append_opks(user_id, keys, created_at_secs, &self.next_opk_id)?;

        txn.commit(ctx)?;
        Ok(inserted)
    }

    fn list_users_with_opks(&self, ctx: &OpContext) -> Result<Vec<String>, StorageError> {
        ctx.check()?;
        let slots: Vec<(String, Arc<Mutex<UserKeys>>)> = self
            .users
            .read()
            .map_err(poisoned)?
            .iter()
            .map(|(user_id, slot)| (user_id.clone(), Arc::clone(slot)))
            .collect();

        let mut users = Vec::new();
        for (user_id, slot) in slots {
            if !slot.lock().map_err(poisoned)?.one_time_prekeys.is_empty() {
                users.push(user_id);
            }
        }

        users.sort_unstable();
        Ok(users)
    }

    fn rotate_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
        update: &SignedPreKeyUpdate,
    ) -> Result<Lookup<SignedPreKey>, StorageError> {
        ctx.check()?;
        let Some(slot) = self.user(user_id)? else {
            return Ok(Lookup::NotFound);
        };

        let mut txn = UserTxn::begin(slot.lock().map_err(poisoned)?);
        if txn.staged.signed_prekey.is_none() {
            return Ok(Lookup::NotFound);
        }

        let rotated = SignedPreKey::from_update(user_id, update);
        txn.staged.signed_prekey = Some(rotated.clone());

        txn.commit(ctx)?;
        Ok(Lookup::Found(rotated))
    }
}
