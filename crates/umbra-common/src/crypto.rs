//! Crypto primitives used by the routing core.
//!
//! The core never decrypts a message — it is deliberately blind to
//! plaintext. What lives here is the *routing-layer* cryptography:
//!
//! - **Per-frame HMAC** — binds every WebSocket frame to the
//!   authenticated session so a hijacked TCP connection can't inject
//!   frames on top of an established TLS tunnel (§4.2).
//! - **Safety number computation** — a human-verifiable fingerprint of
//!   two identity keys that clients compare out-of-band to detect MITM.
//! - **Key material validation** — sanity checks on uploaded public key
//!   blobs (base64 + expected byte length for X25519 / Ed25519).

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Byte length of an Ed25519 / X25519 public key.
const ED25519_PUBLIC_KEY_LEN: usize = 32;
const X25519_PUBLIC_KEY_LEN: usize = 32;

// ============================================================
// Per-frame HMAC (§4.2)
// ============================================================

/// Build the canonical string that is HMAC'd for a frame:
///
/// ```text
/// msg = type ":" timestampISO ":" messageId ":" payloadJSON
/// ```
///
/// `payload_json` must be the *exact* bytes the client transmitted for the
/// `payload` field — no re-serialization is attempted, because canonical
/// JSON renormalization would break wire compatibility with existing
/// clients (§9, "Deterministic canonical HMAC string").
pub fn canonical_frame_string(
    frame_type: &str,
    timestamp_iso: &str,
    message_id: &str,
    payload_json: &str,
) -> String {
    format!("{frame_type}:{timestamp_iso}:{message_id}:{payload_json}")
}

/// Derive the 32-byte HMAC key from a bearer token: the first 32 bytes of
/// the token's UTF-8 bytes, right-padded with zeros if shorter.
pub fn hmac_key_from_token(token: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    let bytes = token.as_bytes();
    let n = bytes.len().min(32);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// Compute `hex(HMAC-SHA-256(key, msg))`.
pub fn sign_frame(key: &[u8; 32], msg: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded HMAC signature against `msg` under `key`, in
/// constant time. Returns `false` on malformed hex as well as on mismatch.
pub fn verify_frame(key: &[u8; 32], msg: &str, signature_hex: &str) -> bool {
    let Ok(given) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg.as_bytes());
    let expected = mac.finalize().into_bytes();
    if given.len() != expected.len() {
        return false;
    }
    given.ct_eq(expected.as_slice()).into()
}

// ============================================================
// Key material validation
// ============================================================

#[derive(Debug, thiserror::Error)]
pub enum KeyValidationError {
    #[error("key is not valid base64: {0}")]
    NotBase64(String),
    #[error("key has wrong length: expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("signature is not valid base64: {0}")]
    BadSignature(String),
}

pub fn validate_key_bytes(
    encoded: &str,
    expected_len: usize,
    label: &str,
) -> Result<Vec<u8>, KeyValidationError> {
    let bytes = B64
        .decode(encoded)
        .map_err(|_| KeyValidationError::NotBase64(label.to_owned()))?;
    if bytes.len() != expected_len {
        return Err(KeyValidationError::WrongLength {
            expected: expected_len,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

pub fn validate_identity_key(encoded: &str) -> Result<Vec<u8>, KeyValidationError> {
    validate_key_bytes(encoded, ED25519_PUBLIC_KEY_LEN, "identity_key")
}

pub fn validate_x25519_key(encoded: &str, label: &str) -> Result<Vec<u8>, KeyValidationError> {
    validate_key_bytes(encoded, X25519_PUBLIC_KEY_LEN, label)
}

pub fn validate_signature(encoded: &str) -> Result<Vec<u8>, KeyValidationError> {
    let bytes = B64
        .decode(encoded)
        .map_err(|_| KeyValidationError::BadSignature("signed_pre_key_sig".to_owned()))?;
    if bytes.len() != 64 {
        return Err(KeyValidationError::WrongLength {
            expected: 64,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

// ============================================================
// Safety number
// ============================================================

/// Compute a safety number (60-digit decimal fingerprint) for a pair of
/// users' identity keys. Both sides produce the same number regardless of
/// argument order.
pub fn compute_safety_number(
    user_id_a: Uuid,
    identity_key_a: &str,
    user_id_b: Uuid,
    identity_key_b: &str,
) -> Result<String, KeyValidationError> {
    let key_a = validate_identity_key(identity_key_a)?;
    let key_b = validate_identity_key(identity_key_b)?;

    let mut pair_a = user_id_a.as_bytes().to_vec();
    pair_a.extend_from_slice(&key_a);

    let mut pair_b = user_id_b.as_bytes().to_vec();
    pair_b.extend_from_slice(&key_b);

    let (first, second) = if pair_a <= pair_b {
        (pair_a, pair_b)
    } else {
        (pair_b, pair_a)
    };

    let mut hasher = Sha512::new();
    hasher.update(&first);
    hasher.update(&second);
    let digest = hasher.finalize();

    let fingerprint = digest[..30]
        .chunks(3)
        .map(|chunk| {
            let n = (chunk[0] as u32) << 16 | (chunk[1] as u32) << 8 | (chunk[2] as u32);
            format!("{:05}", n % 100_000)
        })
        .collect::<Vec<_>>()
        .join(" ");

    Ok(fingerprint)
}

pub fn to_base64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

pub fn from_base64(encoded: &str) -> Option<Vec<u8>> {
    B64.decode(encoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_round_trip() {
        let key = hmac_key_from_token("session-token-abc123");
        let msg = canonical_frame_string("send", "2024-01-15T10:30:00.000Z", "m1", r#"{"a":1}"#);
        let sig = sign_frame(&key, &msg);
        assert!(verify_frame(&key, &msg, &sig));
    }

    #[test]
    fn hmac_rejects_tampered_message() {
        let key = hmac_key_from_token("session-token-abc123");
        let msg = canonical_frame_string("send", "2024-01-15T10:30:00.000Z", "m1", r#"{"a":1}"#);
        let sig = sign_frame(&key, &msg);
        let tampered = canonical_frame_string("send", "2024-01-15T10:30:00.000Z", "m1", r#"{"a":2}"#);
        assert!(!verify_frame(&key, &tampered, &sig));
    }

    #[test]
    fn hmac_rejects_wrong_key() {
        let key_a = hmac_key_from_token("token-a");
        let key_b = hmac_key_from_token("token-b");
        let msg = canonical_frame_string("send", "2024-01-15T10:30:00.000Z", "m1", "{}");
        let sig = sign_frame(&key_a, &msg);
        assert!(!verify_frame(&key_b, &msg, &sig));
    }

    #[test]
    fn hmac_key_padding_is_zero_extended() {
        let key = hmac_key_from_token("short");
        assert_eq!(&key[..5], b"short");
        assert!(key[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn safety_number_is_symmetric() {
        let key_a = to_base64(&[0u8; 32]);
        let key_b = to_base64(&[1u8; 32]);
        let uid_a = Uuid::nil();
        let uid_b = Uuid::max();

        let sn1 = compute_safety_number(uid_a, &key_a, uid_b, &key_b).unwrap();
        let sn2 = compute_safety_number(uid_b, &key_b, uid_a, &key_a).unwrap();
        assert_eq!(sn1, sn2);
        assert_eq!(sn1.replace(' ', "").len(), 50);
    }

    #[test]
    fn validate_identity_key_bad_length() {
        let short = to_base64(&[0u8; 16]);
        assert!(validate_identity_key(&short).is_err());
    }
}
