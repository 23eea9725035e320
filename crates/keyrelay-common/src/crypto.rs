//! Ed25519 helpers for relay request envelopes.
//!
//! Public keys and signatures travel as hex strings on the wire. A leading
//! `0x` is tolerated; anything else that is not exactly 32 (key) or 64
//! (signature) bytes of hex is rejected.

use crate::Pubkey;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use thiserror::Error;

/// Errors produced while decoding key material from the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The string is not valid hex.
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    /// The decoded bytes have the wrong length.
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required byte count.
        expected: usize,
        /// Decoded byte count.
        actual: usize,
    },
    /// The bytes are not a valid Ed25519 point.
    #[error("invalid ed25519 public key")]
    InvalidKey,
}

fn decode_fixed<const N: usize>(input: &str) -> Result<[u8; N], CryptoError> {
    let trimmed = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(trimmed).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        })
}

/// Decodes a hex-encoded Ed25519 public key.
///
/// # Errors
///
/// Returns [`CryptoError`] if the input is not 32 bytes of hex.
///
/// # Examples
///
/// ```
/// let pk = keyrelay_common::crypto::decode_pubkey(&"ab".repeat(32)).unwrap();
/// assert_eq!(pk, [0xAB; 32]);
/// ```
pub fn decode_pubkey(input: &str) -> Result<Pubkey, CryptoError> {
    decode_fixed::<32>(input)
}

/// Normalizes a hex public key to its lower-case, unprefixed form.
///
/// # Errors
///
/// Returns [`CryptoError`] if the input is not 32 bytes of hex.
pub fn normalize_pubkey(input: &str) -> Result<String, CryptoError> {
    decode_pubkey(input).map(hex::encode)
}

/// Signs `message` with an Ed25519 key and returns the hex signature.
///
/// This is what an authorized caller does before handing an envelope to
/// the relay.
///
/// # Examples
///
/// ```
/// use ed25519_dalek::SigningKey;
/// use keyrelay_common::crypto;
///
/// let key = SigningKey::from_bytes(&[7u8; 32]);
/// let sig = crypto::sign_request(&key, b"payload");
/// let pubkey = hex::encode(key.verifying_key().as_bytes());
/// assert!(crypto::verify_request(&pubkey, b"payload", &sig).is_ok());
/// ```
#[must_use]
pub fn sign_request(signing_key: &SigningKey, message: &[u8]) -> String {
    use ed25519_dalek::Signer;
    hex::encode(signing_key.sign(message).to_bytes())
}

/// Verifies a hex Ed25519 `signature` over `message` for the hex `pubkey`.
///
/// Returns `Ok(true)` on a valid signature and `Ok(false)` on a well-formed
/// signature that does not match. Verification is strict: small-order keys
/// and non-canonical `R` components are refused.
///
/// # Errors
///
/// Returns [`CryptoError`] if the key or signature cannot be decoded.
pub fn verify_request(pubkey: &str, message: &[u8], signature: &str) -> Result<bool, CryptoError> {
    let key_bytes = decode_pubkey(pubkey)?;
    let sig_bytes = decode_fixed::<64>(signature)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey)?;
    let sig = Signature::from_bytes(&sig_bytes);
    Ok(key.verify_strict(message, &sig).is_ok())
}

/// Returns the current Unix time in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn pubkey_hex(key: &SigningKey) -> String {
        hex::encode(key.verifying_key().as_bytes())
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let key = key();
        let sig = sign_request(&key, b"hello");
        assert_eq!(verify_request(&pubkey_hex(&key), b"hello", &sig), Ok(true));
    }

    #[test]
    fn wrong_message_fails_verification() {
        let key = key();
        let sig = sign_request(&key, b"hello");
        assert_eq!(verify_request(&pubkey_hex(&key), b"hellp", &sig), Ok(false));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let key = key();
        let other = SigningKey::from_bytes(&[99u8; 32]);
        let sig = sign_request(&key, b"hello");
        assert_eq!(
            verify_request(&pubkey_hex(&other), b"hello", &sig),
            Ok(false)
        );
    }

    #[test]
    fn small_order_key_is_refused() {
        // Identity point as key, identity R and zero s: passes cofactorless
        // verification for any message.
        let mut identity = [0u8; 32];
        identity[0] = 1;
        let mut sig = [0u8; 64];
        sig[0] = 1;
        assert_ne!(
            verify_request(&hex::encode(identity), b"anything", &hex::encode(sig)),
            Ok(true)
        );
    }

    #[test]
    fn prefixed_hex_is_accepted() {
        let key = key();
        let sig = sign_request(&key, b"hello");
        let pk = format!("0x{}", pubkey_hex(&key));
        assert_eq!(verify_request(&pk, b"hello", &format!("0x{sig}")), Ok(true));
    }

    #[test]
    fn short_signature_is_an_error() {
        let key = key();
        let err = verify_request(&pubkey_hex(&key), b"hello", "abcd").unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidLength {
                expected: 64,
                actual: 2
            }
        );
    }

    #[test]
    fn non_hex_pubkey_is_an_error() {
        assert!(matches!(
            decode_pubkey("zz"),
            Err(CryptoError::InvalidHex(_))
        ));
    }

    #[test]
    fn normalize_lowercases_and_strips_prefix() {
        let upper = format!("0x{}", "AB".repeat(32));
        assert_eq!(normalize_pubkey(&upper).unwrap(), "ab".repeat(32));
    }

    #[test]
    fn unix_now_millis_is_reasonable() {
        assert!(unix_now_millis() > 1_704_067_200_000);
    }
}
