//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! All keys survive server restarts.
//!
//! Redb admits one write transaction at a time, so consumption for two
//! different users is serialized at the database level. Each write
//! transaction is short (one range probe and two updates), and readers never
//! block on writers.
//!
//! Redb also locks the database file exclusively. Every service instance in
//! one process must share a single handle (clones of one [`RedbStorage`]);
//! a second process opening the same file gets [`StorageError::Locked`].
//! Deployments with several server processes use
//! [`SqliteStorage`](super::SqliteStorage) instead.

use std::{path::Path, sync::Arc};

use redb::{Database, DatabaseError, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Serialize, de::DeserializeOwned};

use super::{
    Consumption, IdentityKey, KeyStore, Lookup, NewOneTimePreKey, OneTimePreKey, SignedPreKey,
    SignedPreKeyUpdate, StorageError, StoredBundle,
};
use crate::context::OpContext;

/// Table: identity_keys
/// Key: user_id
/// Value: CBOR-encoded IdentityKey
const IDENTITY_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("identity_keys");

/// Table: signed_prekeys
/// Key: user_id
/// Value: CBOR-encoded SignedPreKey
const SIGNED_PREKEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("signed_prekeys");

/// Table: one_time_prekeys
/// Key: (user_id, id)
/// Value: CBOR-encoded OneTimePreKey, used or not
const ONE_TIME_PREKEYS: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("one_time_prekeys");

/// Table: opk_available
/// Key: (user_id, id) of every unused one-time prekey
/// Value: created_at_secs
///
/// Range scans over a user's prefix yield the smallest unused id first.
const OPK_AVAILABLE: TableDefinition<(&str, u64), u64> = TableDefinition::new("opk_available");

/// Table: opk_public_index
/// Key: (user_id, public_key)
/// Value: id
///
/// Enforces uniqueness of a public key per user.
const OPK_PUBLIC_INDEX: TableDefinition<(&str, &str), u64> =
    TableDefinition::new("opk_public_index");

/// Table: meta
/// Key: counter name
/// Value: counter value
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Next one-time prekey id to hand out. Ids start at 1.
const NEXT_OPK_ID: &str = "next_opk_id";

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist.
    ///
    /// # Errors
    ///
    /// - `Locked`: another handle or process already has the file open
    /// - `Io`: the database cannot be opened or created
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => StorageError::Locked(path.display().to_string()),
            e => StorageError::Io(e.to_string()),
        })?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(IDENTITY_KEYS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(SIGNED_PREKEYS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ =
                txn.open_table(ONE_TIME_PREKEYS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(OPK_AVAILABLE).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ =
                txn.open_table(OPK_PUBLIC_INDEX).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(META).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Append keys inside an open write transaction, skipping public keys
    /// the user already has.
    fn append_opks(
        txn: &WriteTransaction,
        user_id: &str,
        keys: &[NewOneTimePreKey],
        created_at_secs: u64,
    ) -> Result<usize, StorageError> {
        let mut meta = txn.open_table(META).map_err(|e| StorageError::Io(e.to_string()))?;
        let mut rows =
            txn.open_table(ONE_TIME_PREKEYS).map_err(|e| StorageError::Io(e.to_string()))?;
        let mut available =
            txn.open_table(OPK_AVAILABLE).map_err(|e| StorageError::Io(e.to_string()))?;
        let mut index =
            txn.open_table(OPK_PUBLIC_INDEX).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut next_id = meta
            .get(NEXT_OPK_ID)
            .map_err(|e| StorageError::Io(e.to_string()))?
            .map_or(1, |value| value.value());

        let mut inserted = 0;
        for key in keys {
            let exists = index
                .get((user_id, key.public_key.as_str()))
                .map_err(|e| StorageError::Io(e.to_string()))?
                .is_some();
            if exists {
                continue;
            }

            let id = next_id;
            next_id = next_id.checked_add(1).ok_or_else(|| {
                StorageError::Constraint("one-time prekey id space exhausted".to_string())
            })?;

            let record = key.clone().into_record(id, user_id, created_at_secs);
            let bytes = encode(&record)?;

            rows.insert((user_id, id), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
            available
                .insert((user_id, id), created_at_secs)
                .map_err(|e| StorageError::Io(e.to_string()))?;
            index
                .insert((user_id, key.public_key.as_str()), id)
                .map_err(|e| StorageError::Io(e.to_string()))?;

            inserted += 1;
        }

        meta.insert(NEXT_OPK_ID, next_id).map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(inserted)
    }
}

impl KeyStore for RedbStorage {
    fn get_identity_key(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<IdentityKey>, StorageError> {
        ctx.check()?;
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(IDENTITY_KEYS).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(user_id).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Lookup::Found(decode(value.value())?)),
            None => Ok(Lookup::NotFound),
        }
    }

    fn get_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<SignedPreKey>, StorageError> {
        ctx.check()?;
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(SIGNED_PREKEYS).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(user_id).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Lookup::Found(decode(value.value())?)),
            None => Ok(Lookup::NotFound),
        }
    }

    fn consume_one_time_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Consumption, StorageError> {
        ctx.check()?;
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let consumed = {
            let mut available =
                txn.open_table(OPK_AVAILABLE).map_err(|e| StorageError::Io(e.to_string()))?;

            let oldest = {
                let mut range = available
                    .range((user_id, 0u64)..=(user_id, u64::MAX))
                    .map_err(|e| StorageError::Io(e.to_string()))?;
                match range.next() {
                    Some(entry) => {
                        let (key, _) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
                        Some(key.value().1)
                    },
                    None => None,
                }
            };

            match oldest {
                Some(id) => {
                    available
                        .remove((user_id, id))
                        .map_err(|e| StorageError::Io(e.to_string()))?;

                    let mut rows = txn
                        .open_table(ONE_TIME_PREKEYS)
                        .map_err(|e| StorageError::Io(e.to_string()))?;

                    let mut key: OneTimePreKey = match rows
                        .get((user_id, id))
                        .map_err(|e| StorageError::Io(e.to_string()))?
                    {
                        Some(value) => decode(value.value())?,
                        None => {
                            return Err(StorageError::Constraint(format!(
                                "available one-time prekey {id} has no row"
                            )));
                        },
                    };

                    key.is_used = true;
                    let bytes = encode(&key)?;
                    rows.insert((user_id, id), bytes.as_slice())
                        .map_err(|e| StorageError::Io(e.to_string()))?;

                    Some(key)
                },
                None => None,
            }
        };

        let Some(key) = consumed else {
            txn.abort().map_err(|e| StorageError::Transaction(e.to_string()))?;
            return Ok(Consumption::Exhausted);
        };

        ctx.check()?;
        txn.commit().map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(Consumption::Consumed(key))
    }

    fn count_available_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<usize, StorageError> {
        ctx.check()?;
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(OPK_AVAILABLE).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut count = 0;
        for result in table
            .range((user_id, 0u64)..=(user_id, u64::MAX))
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            result.map_err(|e| StorageError::Io(e.to_string()))?;
            count += 1;
        }

        Ok(count)
    }

    fn store_bundle(&self, ctx: &OpContext, bundle: &StoredBundle) -> Result<(), StorageError> {
        ctx.check()?;
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut identities =
                txn.open_table(IDENTITY_KEYS).map_err(|e| StorageError::Io(e.to_string()))?;
            let bytes = encode(&bundle.identity_key())?;
            identities
                .insert(bundle.user_id.as_str(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        {
            let mut signed =
                txn.open_table(SIGNED_PREKEYS).map_err(|e| StorageError::Io(e.to_string()))?;
            let record = SignedPreKey::from_update(&bundle.user_id, &bundle.signed_prekey);
            let bytes = encode(&record)?;
            signed
                .insert(bundle.user_id.as_str(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        Self::append_opks(
            &txn,
            &bundle.user_id,
            &bundle.one_time_prekeys,
            bundle.created_at_secs,
        )?;

        ctx.check()?;
        txn.commit().map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(())
    }

    fn insert_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
        keys: &[NewOneTimePreKey],
        created_at_secs: u64,
    ) -> Result<usize, StorageError> {
        ctx.check()?;
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let inserted = Self::append_opks(&txn, user_id, keys, created_at_secs)?;

        ctx.check()?;
        txn.commit().map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(inserted)
    }

    fn list_users_with_opks(&self, ctx: &OpContext) -> Result<Vec<String>, StorageError> {
        ctx.check()?;
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table =
            txn.open_table(ONE_TIME_PREKEYS).map_err(|e| StorageError::Io(e.to_string()))?;

        // Keys are ordered by (user_id, id), so each user's rows are contiguous
        let mut users: Vec<String> = Vec::new();
        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let (user_id, _) = key.value();
            if users.last().map(String::as_str) != Some(user_id) {
                users.push(user_id.to_string());
            }
        }

        Ok(users)
    }

    fn rotate_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
        update: &SignedPreKeyUpdate,
    ) -> Result<Lookup<SignedPreKey>, StorageError> {
        ctx.check()?;
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let rotated = {
            let mut table =
                txn.open_table(SIGNED_PREKEYS).map_err(|e| StorageError::Io(e.to_string()))?;

            let exists =
                table.get(user_id).map_err(|e| StorageError::Io(e.to_string()))?.is_some();

            if exists {
                let record = SignedPreKey::from_update(user_id, update);
                let bytes = encode(&record)?;
                table
                    .insert(user_id, bytes.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
                Some(record)
            } else {
                None
            }
        };

        let Some(record) = rotated else {
            txn.abort().map_err(|e| StorageError::Transaction(e.to_string()))?;
            return Ok(Lookup::NotFound);
        };

        ctx.check()?;
        txn.commit().map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(Lookup::Found(record))
    }
}

/// CBOR-encode a record for storage.
fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR record read from storage.
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::context::CancelToken;

    fn bundle(user_id: &str, opks: &[&str]) -> StoredBundle {
        StoredBundle {
            user_id: user_id.to_string(),
            identity_public_key: "IK1".to_string(),
            identity_private_key_encrypted: Some("sealed-ik".to_string()),
            signed_prekey: SignedPreKeyUpdate {
                public_key: "SPK1".to_string(),
                private_key_encrypted: None,
                signature: "SIG1".to_string(),
                created_at_secs: 1_000,
                expires_at_secs: Some(2_000),
            },
            one_time_prekeys: opks
                .iter()
                .enumerate()
                .map(|(i, public)| NewOneTimePreKey::public(format!("k{i}"), *public))
                .collect(),
            created_at_secs: 1_000,
        }
    }

    #[test]
    fn test_bundle_scenario() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let ctx = OpContext::background();

        storage.store_bundle(&ctx, &bundle("u", &["A", "B"])).unwrap();

        let identity = storage.get_identity_key(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(identity.public_key, "IK1");
        assert_eq!(identity.private_key_encrypted.as_deref(), Some("sealed-ik"));

        let spk = storage.get_signed_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!((spk.public_key.as_str(), spk.signature.as_str()), ("SPK1", "SIG1"));
        assert_eq!(spk.expires_at_secs, Some(2_000));

        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 2);

        let first = storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(first.public_key, "A");
        assert!(first.is_used);
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 1);

        let second = storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(second.public_key, "B");
        assert!(second.id > first.id);

        assert!(storage.consume_one_time_prekey(&ctx, "u").unwrap().is_exhausted());
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 0);
    }

    #[test]
    fn test_unknown_user() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let ctx = OpContext::background();

        assert_eq!(storage.get_identity_key(&ctx, "ghost").unwrap(), Lookup::NotFound);
        assert_eq!(storage.get_signed_prekey(&ctx, "ghost").unwrap(), Lookup::NotFound);
        assert!(storage.consume_one_time_prekey(&ctx, "ghost").unwrap().is_exhausted());
        assert_eq!(storage.count_available_opks(&ctx, "ghost").unwrap(), 0);
    }

    #[test]
    fn test_user_prefixes_do_not_overlap() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let ctx = OpContext::background();

        storage.insert_opks(&ctx, "al", &[NewOneTimePreKey::public("k", "X")], 1).unwrap();
        storage.insert_opks(&ctx, "alice", &[NewOneTimePreKey::public("k", "Y")], 1).unwrap();

        assert_eq!(storage.count_available_opks(&ctx, "al").unwrap(), 1);
        let key = storage.consume_one_time_prekey(&ctx, "alice").unwrap().into_option().unwrap();
        assert_eq!(key.public_key, "Y");
        assert!(storage.consume_one_time_prekey(&ctx, "alice").unwrap().is_exhausted());
        assert_eq!(storage.count_available_opks(&ctx, "al").unwrap(), 1);
    }

    #[test]
    fn test_insert_opks_idempotent() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let ctx = OpContext::background();
        let keys = [
            NewOneTimePreKey::public("k1", "P1"),
            NewOneTimePreKey::public("k2", "P2"),
            NewOneTimePreKey::public("k2-again", "P2"),
        ];

        assert_eq!(storage.insert_opks(&ctx, "u", &keys, 10).unwrap(), 2);
        assert_eq!(storage.insert_opks(&ctx, "u", &keys, 11).unwrap(), 0);
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 2);
    }

    #[test]
    fn test_consumed_public_key_is_not_reinserted() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let ctx = OpContext::background();
        let keys = [NewOneTimePreKey::public("k1", "P1")];

        storage.insert_opks(&ctx, "u", &keys, 10).unwrap();
        storage.consume_one_time_prekey(&ctx, "u").unwrap();

        assert_eq!(storage.insert_opks(&ctx, "u", &keys, 11).unwrap(), 0);
        assert!(storage.consume_one_time_prekey(&ctx, "u").unwrap().is_exhausted());
    }

    #[test]
    fn test_rotation() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let ctx = OpContext::background();
        storage.store_bundle(&ctx, &bundle("u", &["A"])).unwrap();

        let update = SignedPreKeyUpdate {
            public_key: "SPK2".to_string(),
            private_key_encrypted: Some("sealed-spk2".to_string()),
            signature: "SIG2".to_string(),
            created_at_secs: 5_000,
            expires_at_secs: None,
        };

        let rotated = storage.rotate_signed_prekey(&ctx, "u", &update).unwrap();
        let expected = SignedPreKey::from_update("u", &update);

        assert_eq!(rotated, Lookup::Found(expected.clone()));
        assert_eq!(storage.get_signed_prekey(&ctx, "u").unwrap(), Lookup::Found(expected));
        assert_eq!(
            storage.get_identity_key(&ctx, "u").unwrap().into_option().unwrap().public_key,
            "IK1"
        );
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 1);
    }

    #[test]
    fn test_rotation_not_found() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let ctx = OpContext::background();

        let update = bundle("u", &[]).signed_prekey;
        assert_eq!(storage.rotate_signed_prekey(&ctx, "u", &update).unwrap(), Lookup::NotFound);
        assert_eq!(storage.get_signed_prekey(&ctx, "u").unwrap(), Lookup::NotFound);
    }

    #[test]
    fn test_list_users_with_opks() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let ctx = OpContext::background();

        assert!(storage.list_users_with_opks(&ctx).unwrap().is_empty());

        storage.store_bundle(&ctx, &bundle("carol", &["A", "B"])).unwrap();
        storage.store_bundle(&ctx, &bundle("alice", &["A"])).unwrap();
        storage.store_bundle(&ctx, &bundle("bob", &[])).unwrap();
        storage.consume_one_time_prekey(&ctx, "alice").unwrap();

        assert_eq!(storage.list_users_with_opks(&ctx).unwrap(), vec!["alice", "carol"]);
    }

    #[test]
    fn test_cancelled_context_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        storage.store_bundle(&OpContext::background(), &bundle("u", &["A"])).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let cancelled = OpContext::background().with_cancel_token(token);

        assert_eq!(storage.consume_one_time_prekey(&cancelled, "u"), Err(StorageError::Cancelled));
        assert_eq!(
            storage.store_bundle(&cancelled, &bundle("v", &["B"])),
            Err(StorageError::Cancelled)
        );

        let ctx = OpContext::background();
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 1);
        assert_eq!(storage.get_identity_key(&ctx, "v").unwrap(), Lookup::NotFound);
    }

    #[test]
    fn test_second_open_is_locked_until_handle_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let ctx = OpContext::background();

        let storage = RedbStorage::open(&path).unwrap();
        storage.insert_opks(&ctx, "u", &[NewOneTimePreKey::public("k", "P")], 1).unwrap();

        assert!(matches!(RedbStorage::open(&path), Err(StorageError::Locked(_))));

        // Instances in the same process share the handle instead
        let shared = storage.clone();
        assert_eq!(shared.count_available_opks(&ctx, "u").unwrap(), 1);

        drop(storage);
        drop(shared);
        let reopened = RedbStorage::open(&path).unwrap();
        assert_eq!(reopened.count_available_opks(&ctx, "u").unwrap(), 1);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        let consumed_id = {
            let storage = RedbStorage::open(&path).unwrap();
            let ctx = OpContext::background();
            storage.store_bundle(&ctx, &bundle("u", &["A", "B"])).unwrap();
            storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap().id
        };

        let storage = RedbStorage::open(&path).unwrap();
        let ctx = OpContext::background();

        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 1);
        assert!(storage.get_signed_prekey(&ctx, "u").unwrap().is_found());

        // Ids keep increasing across restarts
        storage.insert_opks(&ctx, "u", &[NewOneTimePreKey::public("k9", "C")], 3_000).unwrap();
        let next = storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(next.public_key, "B");
        let last = storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(last.public_key, "C");
        assert!(last.id > next.id && next.id > consumed_id);
    }
}
