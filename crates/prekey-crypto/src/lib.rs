//! Prekey Cryptographic Primitives
//!
//! Two building blocks used by the key-bundle service:
//!
//! - [`KeyEnvelope`]: authenticated encryption of private key material
//!   before it is written to storage, and decryption on read.
//! - [`verify_signed_prekey`]: Ed25519 check that a signed prekey was signed
//!   by the owner's identity key.
//!
//! # Envelope Token Format
//!
//! ```text
//! base64( nonce[24] || ciphertext || poly1305_tag[16] )
//! ```
//!
//! Tokens are self-contained: the nonce travels with the ciphertext, so the
//! only state needed to open a token is the 32-byte envelope key.
//!
//! # Security
//!
//! Confidentiality and integrity:
//! - XChaCha20-Poly1305 with a 256-bit key
//! - A fresh random 192-bit nonce per seal, so sealing the same plaintext
//!   twice yields unrelated tokens
//! - Any modification of a token fails authentication; a token never opens
//!   to a different plaintext
//!
//! Key hygiene:
//! - The envelope key is zeroized on drop and never printed by `Debug`
//! - Opened plaintext is returned in zeroizing buffers

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod envelope;
mod error;
pub mod signature;

pub use envelope::{Envelope, KEY_SIZE, KeyEnvelope, NONCE_SIZE, SecretBytes};
pub use error::{EnvelopeError, SignatureError};
pub use signature::verify_signed_prekey;
