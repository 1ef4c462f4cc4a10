//! Persisted key records.
//!
//! Private halves are stored only as envelope tokens
//! (`private_key_encrypted`). They are optional: a client that keeps its
//! private keys on device uploads public material only.

use serde::{Deserialize, Serialize};

/// Long-term identity key of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKey {
    /// Owning user.
    pub user_id: String,
    /// Encoded public key.
    pub public_key: String,
    /// Envelope token of the private key, if escrowed.
    pub private_key_encrypted: Option<String>,
}

/// Current signed prekey of a user. At most one per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Owning user.
    pub user_id: String,
    /// Encoded public key.
    pub public_key: String,
    /// Envelope token of the private key, if escrowed.
    pub private_key_encrypted: Option<String>,
    /// Identity key signature over the public key.
    pub signature: String,
    /// Unix timestamp (seconds) when this key became current.
    pub created_at_secs: u64,
    /// Unix timestamp (seconds) after which the key should be rotated.
    pub expires_at_secs: Option<u64>,
}

impl SignedPreKey {
    /// Build the record that `update` installs for `user_id`.
    pub fn from_update(user_id: &str, update: &SignedPreKeyUpdate) -> Self {
        Self {
            user_id: user_id.to_string(),
            public_key: update.public_key.clone(),
            private_key_encrypted: update.private_key_encrypted.clone(),
            signature: update.signature.clone(),
            created_at_secs: update.created_at_secs,
            expires_at_secs: update.expires_at_secs,
        }
    }

    /// True if the key has an expiry at or before `now_secs`.
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.expires_at_secs.is_some_and(|expires| expires <= now_secs)
    }
}

/// Single-use prekey.
///
/// # Invariants
///
/// - `id` is assigned by the store and strictly increases with insertion
///   order, so FIFO consumption is "smallest unused id first"
/// - `is_used` only ever moves from `false` to `true`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Store-assigned row id.
    pub id: u64,
    /// Owning user.
    pub user_id: String,
    /// Client-supplied key identifier.
    pub key_id: String,
    /// Encoded public key. Unique per user.
    pub public_key: String,
    /// Envelope token of the private key, if escrowed.
    pub private_key_encrypted: Option<String>,
    /// Whether the key has been handed out.
    pub is_used: bool,
    /// Unix timestamp (seconds) of insertion.
    pub created_at_secs: u64,
}

/// One-time prekey as uploaded, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOneTimePreKey {
    /// Client-supplied key identifier.
    pub key_id: String,
    /// Encoded public key.
    pub public_key: String,
    /// Envelope token of the private key, if escrowed.
    pub private_key_encrypted: Option<String>,
}

impl NewOneTimePreKey {
    /// Public-only upload.
    pub fn public(key_id: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self { key_id: key_id.into(), public_key: public_key.into(), private_key_encrypted: None }
    }

    pub(crate) fn into_record(self, id: u64, user_id: &str, created_at_secs: u64) -> OneTimePreKey {
        OneTimePreKey {
            id,
            user_id: user_id.to_string(),
            key_id: self.key_id,
            public_key: self.public_key,
            private_key_encrypted: self.private_key_encrypted,
            is_used: false,
            created_at_secs,
        }
    }
}

/// Replacement contents for a user's signed prekey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyUpdate {
    /// Encoded public key.
    pub public_key: String,
    /// Envelope token of the private key, if escrowed.
    pub private_key_encrypted: Option<String>,
    /// Identity key signature over the public key.
    pub signature: String,
    /// Unix timestamp (seconds) the key becomes current.
    pub created_at_secs: u64,
    /// Optional expiry (seconds).
    pub expires_at_secs: Option<u64>,
}

/// Full bundle written by registration, private fields already sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBundle {
    /// Owning user.
    pub user_id: String,
    /// Identity public key.
    pub identity_public_key: String,
    /// Envelope token of the identity private key, if escrowed.
    pub identity_private_key_encrypted: Option<String>,
    /// Signed prekey contents.
    pub signed_prekey: SignedPreKeyUpdate,
    /// Initial one-time prekey pool.
    pub one_time_prekeys: Vec<NewOneTimePreKey>,
    /// Timestamp for the inserted one-time prekeys.
    pub created_at_secs: u64,
}

impl StoredBundle {
    /// Identity record this bundle installs.
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            user_id: self.user_id.clone(),
            public_key: self.identity_public_key.clone(),
            private_key_encrypted: self.identity_private_key_encrypted.clone(),
        }
    }
}
