//! Fuzz target for envelope token handling
//!
//! # Strategy
//!
//! - Arbitrary strings fed straight to `open` (malformed base64, wrong
//!   lengths, valid base64 of garbage)
//! - Valid tokens with one byte of the decoded token flipped
//! - Valid tokens truncated at arbitrary points
//!
//! # Invariants
//!
//! - `open` NEVER panics
//! - A modified or truncated token NEVER opens
//! - An untouched token always opens to its plaintext

#![no_main]

use arbitrary::Arbitrary;
use base64::{Engine, engine::general_purpose::STANDARD};
use libfuzzer_sys::fuzz_target;
use prekey_crypto::{Envelope, KeyEnvelope};

#[derive(Debug, Clone, Arbitrary)]
enum TokenAttack {
    RawString { token: String },
    FlipByte { plaintext: Vec<u8>, nonce: [u8; 24], position: u16, mask: u8 },
    Truncate { plaintext: Vec<u8>, nonce: [u8; 24], keep: u16 },
}

fuzz_target!(|input: (u8, TokenAttack)| {
    let (key_byte, attack) = input;
    let envelope = KeyEnvelope::new(&[key_byte; 32]).expect("32-byte key is valid");

    match attack {
        TokenAttack::RawString { token } => {
            let _ = envelope.open(&token);
        },
        TokenAttack::FlipByte { plaintext, nonce, position, mask } => {
            let token = envelope.seal_with_nonce(&plaintext, nonce).expect("seal must succeed");
            let opened = envelope.open(&token).expect("untouched token must open");
            assert_eq!(opened.expose(), plaintext.as_slice());

            if mask == 0 {
                return;
            }

            let mut raw = STANDARD.decode(&token).expect("sealed token is base64");
            let idx = position as usize % raw.len();
            raw[idx] ^= mask;

            assert!(envelope.open(&STANDARD.encode(&raw)).is_err(), "tampered token opened");
        },
        TokenAttack::Truncate { plaintext, nonce, keep } => {
            let token = envelope.seal_with_nonce(&plaintext, nonce).expect("seal must succeed");
            let raw = STANDARD.decode(&token).expect("sealed token is base64");

            let keep = keep as usize % raw.len();
            let truncated = STANDARD.encode(&raw[..keep]);
            assert!(envelope.open(&truncated).is_err(), "truncated token opened");
        },
    }
});
