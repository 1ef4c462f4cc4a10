//! SQLite-backed storage shared between processes.
//!
//! Several server processes may open the same database file. SQLite's file
//! locks make every write transaction exclusive across all of them, and WAL
//! mode keeps readers from blocking on writers.
//!
//! Mutating operations run in `BEGIN IMMEDIATE` transactions: the write lock
//! is taken before the oldest unused key is selected, so two processes can
//! never select the same row. A transaction dropped without `commit` rolls
//! back.
//!
//! Inside one process all calls share one connection and run one at a time.

#![allow(clippy::disallowed_types, reason = "Connection is used from synchronous calls only")]

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};

use super::{
    Consumption, IdentityKey, KeyStore, Lookup, NewOneTimePreKey, OneTimePreKey, SignedPreKey,
    SignedPreKeyUpdate, StorageError, StoredBundle,
};
use crate::context::OpContext;

/// How long a call waits for another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS identity_keys (
    user_id TEXT PRIMARY KEY,
    public_key TEXT NOT NULL,
    private_key_encrypted TEXT
);

CREATE TABLE IF NOT EXISTS signed_prekeys (
    user_id TEXT PRIMARY KEY,
    public_key TEXT NOT NULL,
    private_key_encrypted TEXT,
    signature TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER
);

-- AUTOINCREMENT: ids are never reused, so FIFO order survives deletes
CREATE TABLE IF NOT EXISTS one_time_prekeys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    key_id TEXT NOT NULL,
    public_key TEXT NOT NULL,
    private_key_encrypted TEXT,
    is_used INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    UNIQUE (user_id, public_key)
);

CREATE INDEX IF NOT EXISTS idx_opk_available
    ON one_time_prekeys(user_id, is_used, id);
";

/// Convert a `rusqlite::Error` into a `StorageError`.
///
/// Lock contention that outlasted the busy timeout is a transaction failure
/// (retryable); everything else is I/O.
fn db_err(e: rusqlite::Error) -> StorageError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            StorageError::Transaction(e.to_string())
        },
        _ => StorageError::Io(e.to_string()),
    }
}

fn commit_err(e: rusqlite::Error) -> StorageError {
    StorageError::Transaction(e.to_string())
}

/// Durable storage backed by SQLite, safe to share between processes.
///
/// Clone is cheap (Arc); clones share one connection.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at `path` and apply the schema.
    ///
    /// Any number of processes may open the same file.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the file cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;

        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        tracing::debug!(path = %path.as_ref().display(), "sqlite key store opened");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Io("sqlite connection lock poisoned".into()))
    }

    /// Insert keys inside an open transaction, skipping public keys the user
    /// already has.
    fn append_opks(
        tx: &Transaction<'_>,
        user_id: &str,
        keys: &[NewOneTimePreKey],
        created_at_secs: u64,
    ) -> Result<usize, StorageError> {
        let mut stmt = tx
            .prepare(
                "INSERT INTO one_time_prekeys
                     (user_id, key_id, public_key, private_key_encrypted, is_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)
                 ON CONFLICT (user_id, public_key) DO NOTHING",
            )
            .map_err(db_err)?;

        let mut inserted = 0;
        for key in keys {
            inserted += stmt
                .execute(params![
                    user_id,
                    key.key_id,
                    key.public_key,
                    key.private_key_encrypted,
                    created_at_secs as i64,
                ])
                .map_err(db_err)?;
        }

        Ok(inserted)
    }
}

fn one_time_prekey(row: &Row<'_>) -> rusqlite::Result<OneTimePreKey> {
    Ok(OneTimePreKey {
        id: row.get::<_, i64>(0)? as u64,
        user_id: row.get(1)?,
        key_id: row.get(2)?,
        public_key: row.get(3)?,
        private_key_encrypted: row.get(4)?,
        is_used: row.get(5)?,
        created_at_secs: row.get::<_, i64>(6)? as u64,
    })
}

fn signed_prekey(row: &Row<'_>) -> rusqlite::Result<SignedPreKey> {
    Ok(SignedPreKey {
        user_id: row.get(0)?,
        public_key: row.get(1)?,
        private_key_encrypted: row.get(2)?,
        signature: row.get(3)?,
        created_at_secs: row.get::<_, i64>(4)? as u64,
        expires_at_secs: row.get::<_, Option<i64>>(5)?.map(|secs| secs as u64),
    })
}

impl KeyStore for SqliteStorage {
    fn get_identity_key(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<IdentityKey>, StorageError> {
        ctx.check()?;
        let conn = self.lock()?;

        let key = conn
            .query_row(
                "SELECT user_id, public_key, private_key_encrypted
                 FROM identity_keys WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(IdentityKey {
                        user_id: row.get(0)?,
                        public_key: row.get(1)?,
                        private_key_encrypted: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)?;

        Ok(key.into())
    }

    fn get_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Lookup<SignedPreKey>, StorageError> {
        ctx.check()?;
        let conn = self.lock()?;

        let key = conn
            .query_row(
                "SELECT user_id, public_key, private_key_encrypted, signature, created_at,
                        expires_at
                 FROM signed_prekeys WHERE user_id = ?1",
                params![user_id],
                signed_prekey,
            )
            .optional()
            .map_err(db_err)?;

        Ok(key.into())
    }

    fn consume_one_time_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Consumption, StorageError> {
        ctx.check()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db_err)?;

        let oldest = tx
            .query_row(
                "SELECT id, user_id, key_id, public_key, private_key_encrypted, is_used,
                        created_at
                 FROM one_time_prekeys
                 WHERE user_id = ?1 AND is_used = 0
                 ORDER BY id
                 LIMIT 1",
                params![user_id],
                one_time_prekey,
            )
            .optional()
            .map_err(db_err)?;

        let Some(mut key) = oldest else {
            tx.rollback().map_err(commit_err)?;
            return Ok(Consumption::Exhausted);
        };

        let updated = tx
            .execute(
                "UPDATE one_time_prekeys SET is_used = 1 WHERE id = ?1 AND is_used = 0",
                params![key.id as i64],
            )
            .map_err(db_err)?;
        if updated != 1 {
            return Err(StorageError::Constraint(format!(
                "one-time prekey {} changed under the write lock",
                key.id
            )));
        }
        key.is_used = true;

        ctx.check()?;
        tx.commit().map_err(commit_err)?;

        Ok(Consumption::Consumed(key))
    }

    fn count_available_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<usize, StorageError> {
        ctx.check()?;
        let conn = self.lock()?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ?1 AND is_used = 0",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        Ok(count as usize)
    }

    fn store_bundle(&self, ctx: &OpContext, bundle: &StoredBundle) -> Result<(), StorageError> {
        ctx.check()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db_err)?;

        tx.execute(
            "INSERT INTO identity_keys (user_id, public_key, private_key_encrypted)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id) DO UPDATE SET
                 public_key = excluded.public_key,
                 private_key_encrypted = excluded.private_key_encrypted",
            params![
                bundle.user_id,
                bundle.identity_public_key,
                bundle.identity_private_key_encrypted,
            ],
        )
        .map_err(db_err)?;

        let spk = &bundle.signed_prekey;
        tx.execute(
            "INSERT INTO signed_prekeys
                 (user_id, public_key, private_key_encrypted, signature, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (user_id) DO UPDATE SET
                 public_key = excluded.public_key,
                 private_key_encrypted = excluded.private_key_encrypted,
                 signature = excluded.signature,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at",
            params![
                bundle.user_id,
                spk.public_key,
                spk.private_key_encrypted,
                spk.signature,
                spk.created_at_secs as i64,
                spk.expires_at_secs.map(|secs| secs as i64),
            ],
        )
        .map_err(db_err)?;

        Self::append_opks(&tx, &bundle.user_id, &bundle.one_time_prekeys, bundle.created_at_secs)?;

        ctx.check()?;
        tx.commit().map_err(commit_err)
    }

    fn insert_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
        keys: &[NewOneTimePreKey],
        created_at_secs: u64,
    ) -> Result<usize, StorageError> {
        ctx.check()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db_err)?;

        let inserted = Self::append_opks(&tx, user_id, keys, created_at_secs)?;

        ctx.check()?;
        tx.commit().map_err(commit_err)?;

        Ok(inserted)
    }

    fn list_users_with_opks(&self, ctx: &OpContext) -> Result<Vec<String>, StorageError> {
        ctx.check()?;
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare("SELECT DISTINCT user_id FROM one_time_prekeys ORDER BY user_id")
            .map_err(db_err)?;
        let users = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(db_err)?;

        Ok(users)
    }

    fn rotate_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
        update: &SignedPreKeyUpdate,
    ) -> Result<Lookup<SignedPreKey>, StorageError> {
        ctx.check()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db_err)?;

        let updated = tx
            .execute(
                "UPDATE signed_prekeys
                 SET public_key = ?2, private_key_encrypted = ?3, signature = ?4,
                     created_at = ?5, expires_at = ?6
                 WHERE user_id = ?1",
                params![
                    user_id,
                    update.public_key,
                    update.private_key_encrypted,
                    update.signature,
                    update.created_at_secs as i64,
                    update.expires_at_secs.map(|secs| secs as i64),
                ],
            )
            .map_err(db_err)?;

        if updated == 0 {
            tx.rollback().map_err(commit_err)?;
            return Ok(Lookup::NotFound);
        }

        ctx.check()?;
        tx.commit().map_err(commit_err)?;

        Ok(Lookup::Found(SignedPreKey::from_update(user_id, update)))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Barrier, thread};

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
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();
        let ctx = OpContext::background();

        storage.store_bundle(&ctx, &bundle("u", &["A", "B"])).unwrap();

        let identity = storage.get_identity_key(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(identity.private_key_encrypted.as_deref(), Some("sealed-ik"));
        let spk = storage.get_signed_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(spk.expires_at_secs, Some(2_000));
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 2);

        let first = storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(first.public_key, "A");
        assert!(first.is_used);
        assert_eq!(first.created_at_secs, 1_000);

        let second = storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(second.public_key, "B");
        assert!(second.id > first.id);

        assert!(storage.consume_one_time_prekey(&ctx, "u").unwrap().is_exhausted());
    }

    #[test]
    fn test_unknown_user() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();
        let ctx = OpContext::background();

        assert_eq!(storage.get_identity_key(&ctx, "ghost").unwrap(), Lookup::NotFound);
        assert_eq!(storage.get_signed_prekey(&ctx, "ghost").unwrap(), Lookup::NotFound);
        assert!(storage.consume_one_time_prekey(&ctx, "ghost").unwrap().is_exhausted());
        assert_eq!(storage.count_available_opks(&ctx, "ghost").unwrap(), 0);
    }

    #[test]
    fn test_insert_opks_idempotent() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();
        let ctx = OpContext::background();
        let keys = [
            NewOneTimePreKey::public("k1", "P1"),
            NewOneTimePreKey::public("k2", "P2"),
            NewOneTimePreKey::public("k2-again", "P2"),
        ];

        assert_eq!(storage.insert_opks(&ctx, "u", &keys, 10).unwrap(), 2);
        assert_eq!(storage.insert_opks(&ctx, "u", &keys, 11).unwrap(), 0);
        assert_eq!(storage.insert_opks(&ctx, "v", &keys, 11).unwrap(), 2);
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 2);
    }

    #[test]
    fn test_store_bundle_overwrites() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();
        let ctx = OpContext::background();
        storage.store_bundle(&ctx, &bundle("u", &["A"])).unwrap();

        let mut second = bundle("u", &["A", "B"]);
        second.identity_public_key = "IK2".to_string();
        second.identity_private_key_encrypted = None;
        second.signed_prekey.signature = "SIG2".to_string();
        storage.store_bundle(&ctx, &second).unwrap();

        let identity = storage.get_identity_key(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!((identity.public_key.as_str(), identity.private_key_encrypted), ("IK2", None));
        let spk = storage.get_signed_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(spk.signature, "SIG2");
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 2);
    }

    #[test]
    fn test_rotation() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();
        let ctx = OpContext::background();

        let update = SignedPreKeyUpdate {
            public_key: "SPK2".to_string(),
            private_key_encrypted: Some("sealed-spk2".to_string()),
            signature: "SIG2".to_string(),
            created_at_secs: 5_000,
            expires_at_secs: None,
        };
        assert_eq!(storage.rotate_signed_prekey(&ctx, "u", &update).unwrap(), Lookup::NotFound);

        storage.store_bundle(&ctx, &bundle("u", &["A"])).unwrap();
        let expected = SignedPreKey::from_update("u", &update);

        assert_eq!(
            storage.rotate_signed_prekey(&ctx, "u", &update).unwrap(),
            Lookup::Found(expected.clone())
        );
        assert_eq!(storage.get_signed_prekey(&ctx, "u").unwrap(), Lookup::Found(expected));
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 1);
    }

    #[test]
    fn test_list_users_with_opks() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();
        let ctx = OpContext::background();

        storage.store_bundle(&ctx, &bundle("carol", &["A"])).unwrap();
        storage.store_bundle(&ctx, &bundle("alice", &["A"])).unwrap();
        storage.store_bundle(&ctx, &bundle("bob", &[])).unwrap();
        storage.consume_one_time_prekey(&ctx, "carol").unwrap();

        assert_eq!(storage.list_users_with_opks(&ctx).unwrap(), vec!["alice", "carol"]);
    }

    #[test]
    fn test_cancelled_context_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();
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
    fn test_separate_handles_see_each_others_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let ctx = OpContext::background();

        let first = SqliteStorage::open(&path).unwrap();
        let second = SqliteStorage::open(&path).unwrap();

        first.store_bundle(&ctx, &bundle("u", &["A", "B"])).unwrap();
        assert_eq!(second.count_available_opks(&ctx, "u").unwrap(), 2);

        let key = second.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(key.public_key, "A");
        let key = first.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(key.public_key, "B");
    }

    #[test]
    fn test_separate_handles_consume_exactly_once() {
        const KEYS: usize = 12;
        const HANDLES: usize = 4;
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let ctx = OpContext::background();

        // One connection per handle, as separate server processes would have
        let handles: Vec<_> = (0..HANDLES).map(|_| SqliteStorage::open(&path).unwrap()).collect();
        let keys: Vec<_> = (0..KEYS)
            .map(|i| NewOneTimePreKey::public(format!("k{i}"), format!("P{i}")))
            .collect();
        handles[0].insert_opks(&ctx, "u", &keys, 1).unwrap();

        let barrier = Barrier::new(HANDLES);
        let consumed: Vec<u64> = thread::scope(|scope| {
            let workers: Vec<_> = handles
                .iter()
                .map(|storage| {
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        let ctx = OpContext::background();
                        let mut ids = Vec::new();
                        while let Consumption::Consumed(key) =
                            storage.consume_one_time_prekey(&ctx, "u").unwrap()
                        {
                            ids.push(key.id);
                        }
                        ids
                    })
                })
                .collect();

            workers.into_iter().flat_map(|worker| worker.join().unwrap()).collect()
        });

        let distinct: HashSet<_> = consumed.iter().collect();
        assert_eq!(consumed.len(), KEYS);
        assert_eq!(distinct.len(), KEYS);
        assert_eq!(handles[3].count_available_opks(&ctx, "u").unwrap(), 0);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let consumed_id = {
            let storage = SqliteStorage::open(&path).unwrap();
            let ctx = OpContext::background();
            storage.store_bundle(&ctx, &bundle("u", &["A", "B"])).unwrap();
            storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap().id
        };

        let storage = SqliteStorage::open(&path).unwrap();
        let ctx = OpContext::background();
        assert_eq!(storage.count_available_opks(&ctx, "u").unwrap(), 1);

        storage.insert_opks(&ctx, "u", &[NewOneTimePreKey::public("k9", "C")], 3_000).unwrap();
        let next = storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(next.public_key, "B");
        let last = storage.consume_one_time_prekey(&ctx, "u").unwrap().into_option().unwrap();
        assert_eq!(last.public_key, "C");
        assert!(last.id > next.id && next.id > consumed_id);
    }
}
