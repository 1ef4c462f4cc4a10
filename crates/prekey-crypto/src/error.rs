//! Error types for envelope and signature operations

use thiserror::Error;

/// Errors from sealing or opening envelope tokens
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Envelope key has the wrong size
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required key length
        expected: usize,
        /// Supplied key length
        actual: usize,
    },

    /// Hex-encoded key could not be decoded
    #[error("envelope key is not valid hex")]
    InvalidHex,

    /// Token is not valid base64
    #[error("malformed envelope token")]
    MalformedToken,

    /// Decoded token cannot hold a nonce and an authentication tag
    #[error("envelope token too short: {len} bytes")]
    TokenTooShort {
        /// Decoded token length
        len: usize,
    },

    /// Tag mismatch: the token was tampered with or sealed under another key
    #[error("envelope authentication failed")]
    AuthenticationFailed,

    /// AEAD refused to encrypt
    #[error("envelope encryption failed")]
    Encryption,

    /// OS random source failed while drawing a nonce
    #[error("random source failure: {0}")]
    Rng(String),
}

impl EnvelopeError {
    /// Returns true if this error came from configuration rather than data.
    ///
    /// Configuration errors are fixed by supplying a different key; data
    /// errors mean the stored token itself cannot be trusted.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidKeyLength { .. } | Self::InvalidHex)
    }
}

/// Errors from signed prekey verification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Field is not valid base64 in any accepted alphabet
    #[error("{field} is not valid base64")]
    InvalidEncoding {
        /// Which input failed to decode
        field: &'static str,
    },

    /// Field decoded to the wrong number of bytes
    #[error("{field} has invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Which input had the wrong length
        field: &'static str,
        /// Required length
        expected: usize,
        /// Decoded length
        actual: usize,
    },

    /// Identity key bytes are not a valid Ed25519 point
    #[error("identity key is not a valid Ed25519 public key")]
    InvalidIdentityKey,

    /// Signature does not verify under the identity key
    #[error("signed prekey signature verification failed")]
    VerificationFailed,
}
