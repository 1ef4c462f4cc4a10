//! Bundle service: registration, lookup and one-time prekey consumption.
//!
//! The service sits between request handlers and a [`KeyStore`]. It owns no
//! key state: every call reads or writes the store. Its own job is to
//! validate requests, check signed prekey signatures, and seal private key
//! material with an [`Envelope`] before anything is persisted.
//!
//! # Fail-fast sealing
//!
//! Every supplied private key is sealed before the first store call. If any
//! seal fails, the request fails with [`BundleError::Envelope`] and the store
//! is never touched. Plaintext private keys are never persisted.
//!
//! # Audit
//!
//! Bundle fetches, refills and rejected signatures are reported to an
//! [`AuditSink`] (by default [`NoAudit`]). A failing sink never fails the
//! operation.

use prekey_crypto::{Envelope, SecretBytes, verify_signed_prekey};

use crate::{
    audit::{AuditAction, AuditDetail, AuditEvent, AuditSink, AuditStatus, BundleStep, NoAudit},
    clock::Clock,
    config::ServiceConfig,
    context::OpContext,
    error::{BundleError, KeyKind},
    storage::{
        Consumption, IdentityKey, KeyStore, Lookup, NewOneTimePreKey, SignedPreKey,
        SignedPreKeyUpdate, StoredBundle,
    },
};

/// One-time prekey as uploaded by a client.
#[derive(Debug, Clone)]
pub struct OneTimePreKeyUpload {
    /// Client-chosen identifier. Must not be empty.
    pub key_id: String,
    /// Encoded public key.
    pub public_key: String,
    /// Plaintext private key to escrow, if any.
    pub private_key: Option<SecretBytes>,
}

impl OneTimePreKeyUpload {
    /// Upload carrying only public material.
    pub fn public(key_id: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self { key_id: key_id.into(), public_key: public_key.into(), private_key: None }
    }
}

/// Registration request: a user's full initial bundle.
///
/// Private keys are optional. An empty private key is treated as absent.
#[derive(Debug, Clone)]
pub struct RegisterBundle {
    /// Owning user.
    pub user_id: String,
    /// Identity public key (base64 Ed25519 when signatures are verified).
    pub identity_public_key: String,
    /// Identity private key to escrow.
    pub identity_private_key: Option<SecretBytes>,
    /// Signed prekey public key.
    pub signed_prekey_public_key: String,
    /// Signed prekey private key to escrow.
    pub signed_prekey_private_key: Option<SecretBytes>,
    /// Identity key signature over the signed prekey.
    pub signed_prekey_signature: String,
    /// Optional signed prekey expiry (seconds).
    pub signed_prekey_expires_at_secs: Option<u64>,
    /// Initial one-time prekey pool.
    pub one_time_prekeys: Vec<OneTimePreKeyUpload>,
}

/// Replacement signed prekey.
#[derive(Debug, Clone)]
pub struct RotateSignedPreKey {
    /// New public key.
    pub public_key: String,
    /// New private key to escrow. Absent clears any escrowed private key.
    pub private_key: Option<SecretBytes>,
    /// Identity key signature over the new public key.
    pub signature: String,
    /// Optional expiry (seconds).
    pub expires_at_secs: Option<u64>,
}

/// One-time prekey as handed to an initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedOneTimePreKey {
    /// Store-assigned id, so the responder can find the matching private key.
    pub id: u64,
    /// Client-chosen identifier.
    pub key_id: String,
    /// Encoded public key.
    pub public_key: String,
}

/// Public key material an initiator needs to start an X3DH session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Responder.
    pub user_id: String,
    /// Identity public key.
    pub identity_key: String,
    /// Signed prekey public key.
    pub signed_prekey: String,
    /// Signature over the signed prekey.
    pub signed_prekey_signature: String,
    /// Signed prekey expiry, if set.
    pub signed_prekey_expires_at_secs: Option<u64>,
    /// Freshly consumed one-time prekey.
    ///
    /// `None` when the pool is exhausted; the session then runs without one.
    pub one_time_prekey: Option<PublishedOneTimePreKey>,
}

/// Prekey bundle service over a key store.
pub struct BundleService<S: KeyStore, E: Envelope, C: Clock, A: AuditSink = NoAudit> {
    store: S,
    envelope: E,
    clock: C,
    config: ServiceConfig,
    audit: A,
}

impl<S: KeyStore, E: Envelope, C: Clock> BundleService<S, E, C> {
    /// Create a service over `store`, sealing private keys with `envelope`.
    ///
    /// Audit events are discarded until a sink is set with
    /// [`BundleService::with_audit`].
    pub fn new(store: S, envelope: E, clock: C, config: ServiceConfig) -> Self {
        Self { store, envelope, clock, config, audit: NoAudit }
    }
}

impl<S: KeyStore, E: Envelope, C: Clock, A: AuditSink> BundleService<S, E, C, A> {
    /// Report audit events to `audit`.
    pub fn with_audit<B: AuditSink>(self, audit: B) -> BundleService<S, E, C, B> {
        let Self { store, envelope, clock, config, audit: _ } = self;
        BundleService { store, envelope, clock, config, audit }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Register a user's bundle.
    ///
    /// Overwrites any existing identity key and signed prekey; one-time
    /// prekeys whose public key the user already has are skipped.
    ///
    /// # Errors
    ///
    /// - `InvalidInput`: empty user id, public key, signature or key id
    /// - `Signature`: the signed prekey does not verify (when enabled)
    /// - `Envelope`: sealing a private key failed; nothing was stored
    /// - `Storage`: the store rejected the bundle; nothing was stored
    pub fn register_bundle(
        &self,
        ctx: &OpContext,
        request: RegisterBundle,
    ) -> Result<(), BundleError> {
        let user_id = request.user_id.as_str();
        require("user id", user_id)?;
        require("identity public key", &request.identity_public_key)?;
        require("signed prekey", &request.signed_prekey_public_key)?;
        require("signed prekey signature", &request.signed_prekey_signature)?;
        validate_uploads(&request.one_time_prekeys)?;

        if self.config.verify_signatures {
            verify_signed_prekey(
                &request.identity_public_key,
                &request.signed_prekey_public_key,
                &request.signed_prekey_signature,
            )
            .inspect_err(|e| {
                tracing::warn!(user_id, error = %e, "rejected signed prekey");
                self.audit(
                    AuditAction::RegisterBundle,
                    AuditStatus::Failure,
                    user_id,
                    "Invalid SPK signature",
                    AuditDetail::None,
                );
            })?;
        }

        let identity_private_key_encrypted = self.seal(request.identity_private_key.as_ref())?;
        let signed_prekey_private_key_encrypted =
            self.seal(request.signed_prekey_private_key.as_ref())?;
        let one_time_prekeys = self.seal_uploads(&request.one_time_prekeys)?;

        let now = self.clock.wall_clock_secs();
        let bundle = StoredBundle {
            user_id: request.user_id.clone(),
            identity_public_key: request.identity_public_key,
            identity_private_key_encrypted,
            signed_prekey: SignedPreKeyUpdate {
                public_key: request.signed_prekey_public_key,
                private_key_encrypted: signed_prekey_private_key_encrypted,
                signature: request.signed_prekey_signature,
                created_at_secs: now,
                expires_at_secs: request.signed_prekey_expires_at_secs,
            },
            one_time_prekeys,
            created_at_secs: now,
        };

        self.store
            .store_bundle(ctx, &bundle)
            .map_err(BundleError::storage("store_bundle", user_id))
            .inspect_err(|e| tracing::warn!(user_id, error = %e, "bundle registration failed"))?;

        tracing::debug!(user_id, opks = bundle.one_time_prekeys.len(), "registered bundle");
        Ok(())
    }

    /// Number of unused one-time prekeys for a user.
    pub fn count_available_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<usize, BundleError> {
        self.store
            .count_available_opks(ctx, user_id)
            .map_err(BundleError::storage("count_available_opks", user_id))
    }

    /// A user's identity key.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user never registered; `Storage` on store failure.
    pub fn identity_key(&self, ctx: &OpContext, user_id: &str) -> Result<IdentityKey, BundleError> {
        let lookup = self
            .store
            .get_identity_key(ctx, user_id)
            .map_err(BundleError::storage("get_identity_key", user_id))?;

        found(lookup, KeyKind::Identity, user_id)
    }

    /// A user's current signed prekey.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user has no signed prekey; `Storage` on store
    /// failure.
    pub fn signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<SignedPreKey, BundleError> {
        let lookup = self
            .store
            .get_signed_prekey(ctx, user_id)
            .map_err(BundleError::storage("get_signed_prekey", user_id))?;

        found(lookup, KeyKind::SignedPreKey, user_id)
    }

    /// Hand out the user's oldest unused one-time prekey exactly once.
    pub fn consume_one_time_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<Consumption, BundleError> {
        let consumption = self
            .store
            .consume_one_time_prekey(ctx, user_id)
            .map_err(BundleError::storage("consume_one_time_prekey", user_id))
            .inspect_err(|e| {
                tracing::warn!(user_id, error = %e, "one-time prekey consumption failed");
            })?;

        match &consumption {
            Consumption::Consumed(key) => {
                tracing::debug!(user_id, opk_id = key.id, "consumed one-time prekey");
            },
            Consumption::Exhausted => {
                tracing::info!(user_id, "one-time prekeys exhausted");
            },
        }

        Ok(consumption)
    }

    /// Assemble a bundle for an initiator, consuming one one-time prekey.
    ///
    /// An exhausted pool still yields a bundle, without a one-time prekey.
    ///
    /// # Errors
    ///
    /// Identity and signed prekey lookups fail with their own `NotFound`;
    /// store failures are returned as `Storage`. A missing identity or
    /// signed prekey is detected before any key is consumed.
    ///
    /// Audited as `GET_BUNDLE`: the failing step, or success with whether a
    /// one-time prekey was included.
    pub fn fetch_bundle(
        &self,
        ctx: &OpContext,
        user_id: &str,
    ) -> Result<PreKeyBundle, BundleError> {
        let failed_at = |step: BundleStep, description: &'static str| {
            self.audit(
                AuditAction::GetBundle,
                AuditStatus::Failure,
                user_id,
                description,
                AuditDetail::FailedStep(step),
            );
        };

        let identity = self
            .identity_key(ctx, user_id)
            .inspect_err(|_| failed_at(BundleStep::IdentityKey, "Failed to fetch IK"))?;
        let signed = self
            .signed_prekey(ctx, user_id)
            .inspect_err(|_| failed_at(BundleStep::SignedPreKey, "Failed to fetch SPK"))?;

        if signed.is_expired(self.clock.wall_clock_secs()) {
            tracing::warn!(user_id, "serving expired signed prekey");
        }

        let consumption = self
            .consume_one_time_prekey(ctx, user_id)
            .inspect_err(|_| failed_at(BundleStep::OneTimePreKey, "Failed to consume OPK"))?;
        let one_time_prekey = consumption.into_option().map(|key| PublishedOneTimePreKey {
            id: key.id,
            key_id: key.key_id,
            public_key: key.public_key,
        });

        self.audit(
            AuditAction::GetBundle,
            AuditStatus::Success,
            user_id,
            "Fetched X3DH bundle",
            AuditDetail::Bundle { has_opk: one_time_prekey.is_some() },
        );

        Ok(PreKeyBundle {
            user_id: user_id.to_string(),
            identity_key: identity.public_key,
            signed_prekey: signed.public_key,
            signed_prekey_signature: signed.signature,
            signed_prekey_expires_at_secs: signed.expires_at_secs,
            one_time_prekey,
        })
    }

    /// Append one-time prekeys to a user's pool.
    ///
    /// Returns how many were new. Keys whose public key the user already has
    /// are skipped, so retrying a refill is harmless.
    ///
    /// # Errors
    ///
    /// - `InvalidInput`: empty user id, key id or public key
    /// - `Envelope`: sealing a private key failed; nothing was stored
    /// - `Storage`: store failure; nothing was stored
    ///
    /// Audited as `REFILL_OPKS` with the number of offered keys once the
    /// request has passed validation.
    pub fn refill_opks(
        &self,
        ctx: &OpContext,
        user_id: &str,
        uploads: &[OneTimePreKeyUpload],
    ) -> Result<usize, BundleError> {
        require("user id", user_id)?;
        validate_uploads(uploads)?;
        if uploads.is_empty() {
            return Ok(0);
        }

        let result = self.seal_uploads(uploads).and_then(|keys| {
            self.store
                .insert_opks(ctx, user_id, &keys, self.clock.wall_clock_secs())
                .map_err(BundleError::storage("insert_opks", user_id))
        });

        let (status, description) = match &result {
            Ok(_) => (AuditStatus::Success, "Refilled OPKs"),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "one-time prekey refill failed");
                (AuditStatus::Failure, "Failed to refill OPKs")
            },
        };
        self.audit(
            AuditAction::RefillOpks,
            status,
            user_id,
            description,
            AuditDetail::Refill { num_opks: uploads.len() },
        );

        let inserted = result?;

        tracing::debug!(user_id, offered = uploads.len(), inserted, "refilled one-time prekeys");
        Ok(inserted)
    }

    /// Replace a user's signed prekey.
    ///
    /// When signature checks are enabled, the new signature must verify
    /// against the stored identity key.
    ///
    /// # Errors
    ///
    /// - `InvalidInput`: empty user id, public key or signature
    /// - `NotFound`: no identity key (when verifying) or no signed prekey
    /// - `Signature`: the new signature does not verify
    /// - `Envelope`: sealing the private key failed; nothing was changed
    /// - `Storage`: store failure; nothing was changed
    pub fn rotate_signed_prekey(
        &self,
        ctx: &OpContext,
        user_id: &str,
        request: RotateSignedPreKey,
    ) -> Result<SignedPreKey, BundleError> {
        require("user id", user_id)?;
        require("signed prekey", &request.public_key)?;
        require("signed prekey signature", &request.signature)?;

        if self.config.verify_signatures {
            let identity = self.identity_key(ctx, user_id)?;
            verify_signed_prekey(&identity.public_key, &request.public_key, &request.signature)
                .inspect_err(|e| {
                    tracing::warn!(user_id, error = %e, "rejected rotated prekey");
                    self.audit(
                        AuditAction::RotateSignedPreKey,
                        AuditStatus::Failure,
                        user_id,
                        "Invalid SPK signature",
                        AuditDetail::None,
                    );
                })?;
        }

        let update = SignedPreKeyUpdate {
            private_key_encrypted: self.seal(request.private_key.as_ref())?,
            public_key: request.public_key,
            signature: request.signature,
            created_at_secs: self.clock.wall_clock_secs(),
            expires_at_secs: request.expires_at_secs,
        };

        let lookup = self
            .store
            .rotate_signed_prekey(ctx, user_id, &update)
            .map_err(BundleError::storage("rotate_signed_prekey", user_id))
            .inspect_err(|e| tracing::warn!(user_id, error = %e, "signed prekey rotation failed"))?;

        let rotated = found(lookup, KeyKind::SignedPreKey, user_id)?;
        tracing::info!(user_id, "rotated signed prekey");
        Ok(rotated)
    }

    /// Users with at least one one-time prekey row, used or not.
    pub fn users_with_opks(&self, ctx: &OpContext) -> Result<Vec<String>, BundleError> {
        self.store.list_users_with_opks(ctx).map_err(|source| BundleError::Storage {
            op: "list_users_with_opks",
            user_id: None,
            source,
        })
    }

    /// Open a stored private key token.
    pub fn open_private_key(&self, token: &str) -> Result<SecretBytes, BundleError> {
        Ok(self.envelope.open(token)?)
    }

    fn audit(
        &self,
        action: AuditAction,
        status: AuditStatus,
        user_id: &str,
        description: &'static str,
        detail: AuditDetail,
    ) {
        let event = AuditEvent {
            action,
            status,
            user_id: user_id.to_string(),
            description,
            timestamp_secs: self.clock.wall_clock_secs(),
            detail,
        };

        if let Err(e) = self.audit.record(&event) {
            tracing::warn!(user_id, %action, error = %e, "audit record dropped");
        }
    }

    fn seal(&self, secret: Option<&SecretBytes>) -> Result<Option<String>, BundleError> {
        let Some(secret) = secret.filter(|secret| !secret.is_empty()) else {
            return Ok(None);
        };

        let token = self
            .envelope
            .seal(secret.expose())
            .inspect_err(|e| tracing::warn!(error = %e, "sealing private key failed"))?;
        Ok(Some(token))
    }

    fn seal_uploads(
        &self,
        uploads: &[OneTimePreKeyUpload],
    ) -> Result<Vec<NewOneTimePreKey>, BundleError> {
        uploads
            .iter()
            .map(|upload| {
                Ok(NewOneTimePreKey {
                    key_id: upload.key_id.clone(),
                    public_key: upload.public_key.clone(),
                    private_key_encrypted: self.seal(upload.private_key.as_ref())?,
                })
            })
            .collect()
    }
}

fn require(field: &str, value: &str) -> Result<(), BundleError> {
    if value.trim().is_empty() {
        return Err(BundleError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_uploads(uploads: &[OneTimePreKeyUpload]) -> Result<(), BundleError> {
    for upload in uploads {
        require("one-time prekey id", &upload.key_id)?;
        require("one-time prekey", &upload.public_key)?;
    }
    Ok(())
}

fn found<T>(lookup: Lookup<T>, kind: KeyKind, user_id: &str) -> Result<T, BundleError> {
    lookup.into_option().ok_or_else(|| BundleError::NotFound { kind, user_id: user_id.to_string() })
}
