//! Fuzz target for signed prekey verification
//!
//! # Strategy
//!
//! - Arbitrary strings for all three inputs (encoding and length errors)
//! - Real Ed25519 signatures with one byte of the prekey or signature
//!   flipped
//!
//! # Invariants
//!
//! - Verification NEVER panics
//! - A genuine signature always verifies
//! - A modified prekey or signature NEVER verifies

#![no_main]

use arbitrary::Arbitrary;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signer, SigningKey};
use libfuzzer_sys::fuzz_target;
use prekey_crypto::verify_signed_prekey;

#[derive(Debug, Clone, Arbitrary)]
enum SignatureCase {
    Garbage { identity: String, prekey: String, signature: String },
    Tampered { seed: [u8; 32], prekey: [u8; 32], flip_signature: bool, position: u8, mask: u8 },
}

fuzz_target!(|case: SignatureCase| {
    match case {
        SignatureCase::Garbage { identity, prekey, signature } => {
            let _ = verify_signed_prekey(&identity, &prekey, &signature);
        },
        SignatureCase::Tampered { seed, mut prekey, flip_signature, position, mask } => {
            let signing = SigningKey::from_bytes(&seed);
            let mut signature = signing.sign(&prekey).to_bytes();
            let identity = URL_SAFE_NO_PAD.encode(signing.verifying_key().as_bytes());

            assert!(
                verify_signed_prekey(
                    &identity,
                    &URL_SAFE_NO_PAD.encode(prekey),
                    &URL_SAFE_NO_PAD.encode(signature),
                )
                .is_ok(),
                "genuine signature rejected"
            );

            if mask == 0 {
                return;
            }

            if flip_signature {
                signature[position as usize % signature.len()] ^= mask;
            } else {
                prekey[position as usize % prekey.len()] ^= mask;
            }

            assert!(
                verify_signed_prekey(
                    &identity,
                    &URL_SAFE_NO_PAD.encode(prekey),
                    &URL_SAFE_NO_PAD.encode(signature),
                )
                .is_err(),
                "tampered signature accepted"
            );
        },
    }
});
