//! Envelope encryption using `XChaCha20-Poly1305`
//!
//! Wraps private key material before it reaches storage. Each seal draws a
//! fresh nonce from the OS random source; [`KeyEnvelope::seal_with_nonce`]
//! takes the nonce from the caller for deterministic tests.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use zeroize::Zeroizing;

use crate::error::EnvelopeError;

/// Envelope key size (256-bit)
pub const KEY_SIZE: usize = 32;

/// `XChaCha20` nonce size (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// Plaintext secret bytes, zeroized on drop.
///
/// `Debug` prints only the length so secrets never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    /// Wrap owned secret bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Borrow the secret.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Secret length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for SecretBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl From<&str> for SecretBytes {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {} bytes])", self.0.len())
    }
}

/// Seal and open private key material.
///
/// Implementations must be randomized (sealing the same plaintext twice
/// yields different tokens) and authenticated (a modified token never opens).
pub trait Envelope: Send + Sync + 'static {
    /// Encrypt `plaintext` into a printable, self-contained token.
    fn seal(&self, plaintext: &[u8]) -> Result<String, EnvelopeError>;

    /// Decrypt a token produced by [`Envelope::seal`] under the same key.
    fn open(&self, token: &str) -> Result<SecretBytes, EnvelopeError>;
}

/// `XChaCha20-Poly1305` envelope keyed by a fixed 32-byte secret.
#[derive(Clone)]
pub struct KeyEnvelope {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl KeyEnvelope {
    /// Create an envelope from raw key bytes.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyLength`: `key` is not exactly [`KEY_SIZE`] bytes
    pub fn new(key: &[u8]) -> Result<Self, EnvelopeError> {
        let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| {
            EnvelopeError::InvalidKeyLength { expected: KEY_SIZE, actual: key.len() }
        })?;

        Ok(Self { key: Zeroizing::new(key) })
    }

    /// Create an envelope from a hex-encoded key (64 hex characters).
    ///
    /// # Errors
    ///
    /// - `InvalidHex`: not valid hex
    /// - `InvalidKeyLength`: decodes to anything other than 32 bytes
    pub fn from_hex(encoded: &str) -> Result<Self, EnvelopeError> {
        let bytes =
            Zeroizing::new(hex::decode(encoded.trim()).map_err(|_| EnvelopeError::InvalidHex)?);
        Self::new(&bytes)
    }

    /// Seal with a caller-provided nonce.
    ///
    /// # Security
    ///
    /// A nonce must never be reused under the same key. Production code uses
    /// [`Envelope::seal`], which draws the nonce from the OS.
    pub fn seal_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: [u8; NONCE_SIZE],
    ) -> Result<String, EnvelopeError> {
        let cipher = XChaCha20Poly1305::new((&*self.key).into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| EnvelopeError::Encryption)?;

        let mut raw = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(raw))
    }
}

impl Envelope for KeyEnvelope {
    fn seal(&self, plaintext: &[u8]) -> Result<String, EnvelopeError> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|e| EnvelopeError::Rng(e.to_string()))?;
        self.seal_with_nonce(plaintext, nonce)
    }

    fn open(&self, token: &str) -> Result<SecretBytes, EnvelopeError> {
        let raw = STANDARD.decode(token).map_err(|_| EnvelopeError::MalformedToken)?;
        if raw.len() < NONCE_SIZE + POLY1305_TAG_SIZE {
            return Err(EnvelopeError::TokenTooShort { len: raw.len() });
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&*self.key).into());

        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(SecretBytes::new)
            .map_err(|_| EnvelopeError::AuthenticationFailed)
    }
}

impl fmt::Debug for KeyEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEnvelope").field("key", &"[REDACTED]").finish()
    }
}
