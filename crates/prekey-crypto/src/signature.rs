//! Signed prekey verification.
//!
//! A signed prekey is only published if its signature verifies under the
//! owner's Ed25519 identity key. Clients encode keys with different base64
//! alphabets, so decoding tries URL-safe without padding, URL-safe with
//! padding, then standard base64.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, Signature, VerifyingKey};

use crate::error::SignatureError;

/// Verify that `signature` is the identity key's signature over the signed
/// prekey's raw public bytes.
///
/// All three inputs are base64 strings as uploaded by the client.
///
/// # Errors
///
/// - `InvalidEncoding`: an input is not base64
/// - `InvalidLength`: identity key or signed prekey is not 32 bytes, or the
///   signature is not 64 bytes
/// - `InvalidIdentityKey`: identity key bytes are not a curve point
/// - `VerificationFailed`: signature does not verify
pub fn verify_signed_prekey(
    identity_key: &str,
    signed_prekey: &str,
    signature: &str,
) -> Result<(), SignatureError> {
    let identity: [u8; PUBLIC_KEY_LENGTH] = decode_fixed("identity key", identity_key)?;
    let prekey: [u8; PUBLIC_KEY_LENGTH] = decode_fixed("signed prekey", signed_prekey)?;
    let signature: [u8; SIGNATURE_LENGTH] = decode_fixed("signature", signature)?;

    let verifying_key =
        VerifyingKey::from_bytes(&identity).map_err(|_| SignatureError::InvalidIdentityKey)?;

    verifying_key
        .verify_strict(&prekey, &Signature::from_bytes(&signature))
        .map_err(|_| SignatureError::VerificationFailed)
}

fn decode_fixed<const N: usize>(
    field: &'static str,
    encoded: &str,
) -> Result<[u8; N], SignatureError> {
    let bytes = decode_any_base64(encoded).ok_or(SignatureError::InvalidEncoding { field })?;
    let actual = bytes.len();

    bytes.try_into().map_err(|_| SignatureError::InvalidLength { field, expected: N, actual })
}

fn decode_any_base64(encoded: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .or_else(|_| STANDARD.decode(encoded))
        .ok()
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    struct Fixture {
        identity: String,
        prekey: String,
        signature: String,
    }

    fn fixture(seed: u8) -> Fixture {
        let identity = SigningKey::from_bytes(&[seed; 32]);
        let prekey = SigningKey::from_bytes(&[seed.wrapping_add(1); 32]).verifying_key();
        let signature = identity.sign(prekey.as_bytes());

        Fixture {
            identity: STANDARD.encode(identity.verifying_key().as_bytes()),
            prekey: STANDARD.encode(prekey.as_bytes()),
            signature: STANDARD.encode(signature.to_bytes()),
        }
    }

    #[test]
    fn valid_signature_verifies() {
        let f = fixture(1);
        verify_signed_prekey(&f.identity, &f.prekey, &f.signature).unwrap();
    }

    #[test]
    fn url_safe_encodings_accepted() {
        let f = fixture(2);
        let reencode = |s: &str| URL_SAFE_NO_PAD.encode(STANDARD.decode(s).unwrap());

        verify_signed_prekey(&reencode(&f.identity), &reencode(&f.prekey), &reencode(&f.signature))
            .unwrap();
    }

    #[test]
    fn signature_from_other_identity_rejected() {
        let f = fixture(3);
        let other = fixture(4);

        assert_eq!(
            verify_signed_prekey(&other.identity, &f.prekey, &f.signature),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn signature_over_other_prekey_rejected() {
        let f = fixture(5);
        let other = fixture(6);

        assert_eq!(
            verify_signed_prekey(&f.identity, &other.prekey, &f.signature),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_lengths_rejected() {
        let f = fixture(7);

        assert_eq!(
            verify_signed_prekey(&f.identity, &f.prekey, &STANDARD.encode([0u8; 10])),
            Err(SignatureError::InvalidLength { field: "signature", expected: 64, actual: 10 })
        );
        assert_eq!(
            verify_signed_prekey(&STANDARD.encode([1u8; 33]), &f.prekey, &f.signature),
            Err(SignatureError::InvalidLength { field: "identity key", expected: 32, actual: 33 })
        );
    }

    #[test]
    fn garbage_encoding_rejected() {
        let f = fixture(8);

        assert_eq!(
            verify_signed_prekey(&f.identity, "***", &f.signature),
            Err(SignatureError::InvalidEncoding { field: "signed prekey" })
        );
    }
}
