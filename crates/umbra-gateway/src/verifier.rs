//! Per-frame HMAC verification (§4.2).
//!
//! Wraps the canonical-string and constant-time-compare primitives in
//! `umbra_common::crypto` with the frame-shaped glue: pulling `type`,
//! `timestamp`, `messageId`, and the exact payload bytes off an
//! [`Envelope`], and enforcing the 5 s clock-skew window.

use chrono::{DateTime, Utc};
use umbra_common::crypto;

use crate::frame::Envelope;

/// Frames this far outside "now" are rejected as stale even with a valid
/// signature (§4.3 "rejection window 5 s of clock skew").
pub const CLOCK_SKEW_WINDOW: chrono::Duration = chrono::Duration::seconds(5);

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    #[error("missing signature, nonce, or timestamp")]
    MissingFields,
    #[error("timestamp is not valid RFC3339")]
    BadTimestamp,
    #[error("frame timestamp outside the allowed clock-skew window")]
    StaleTimestamp,
    #[error("HMAC signature verification failed")]
    BadSignature,
}

/// Verify a frame's HMAC and timestamp freshness. Every frame except
/// `error`/`heartbeat_ack` originating at the server must pass this before
/// dispatch.
pub fn verify(envelope: &Envelope, hmac_key: &[u8; 32], now: DateTime<Utc>) -> Result<(), VerifyError> {
    let (Some(signature), Some(timestamp)) = (&envelope.signature, &envelope.timestamp) else {
        return Err(VerifyError::MissingFields);
    };

    let ts = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| VerifyError::BadTimestamp)?
        .with_timezone(&Utc);

    if (now - ts).abs() > CLOCK_SKEW_WINDOW {
        return Err(VerifyError::StaleTimestamp);
    }

    let message_id = envelope
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_default();

    let msg = crypto::canonical_frame_string(
        &envelope.frame_type,
        timestamp,
        &message_id,
        envelope.payload_json(),
    );

    if crypto::verify_frame(hmac_key, &msg, signature) {
        Ok(())
    } else {
        Err(VerifyError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::raw_payload;
    use serde_json::json;

    fn signed_envelope(key: &[u8; 32], frame_type: &str, now: DateTime<Utc>) -> Envelope {
        let timestamp = now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let message_id = uuid::Uuid::new_v4();
        let payload = raw_payload(&json!({"is_typing": true}));
        let msg = crypto::canonical_frame_string(frame_type, &timestamp, &message_id.to_string(), payload.get());
        let signature = crypto::sign_frame(key, &msg);

        Envelope {
            frame_type: frame_type.to_owned(),
            message_id: Some(message_id),
            sender_id: None,
            device_id: None,
            server_id: None,
            timestamp: Some(timestamp),
            payload,
            signature: Some(signature),
            nonce: Some("abcd1234abcd1234".to_owned()),
            relay_targets: None,        }
    }

    #[test]
    fn accepts_valid_signature() {
        let key = crypto::hmac_key_from_token("session-abc");
        let now = Utc::now();
        let env = signed_envelope(&key, "typing", now);
        assert!(verify(&env, &key, now).is_ok());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let key = crypto::hmac_key_from_token("session-abc");
        let now = Utc::now();
        let env = signed_envelope(&key, "typing", now - chrono::Duration::seconds(30));
        assert_eq!(verify(&env, &key, now), Err(VerifyError::StaleTimestamp));
    }

    #[test]
    fn rejects_tampered_payload() {
        let key = crypto::hmac_key_from_token("session-abc");
        let now = Utc::now();
        let mut env = signed_envelope(&key, "typing", now);
        env.payload = raw_payload(&json!({"is_typing": false}));
        assert_eq!(verify(&env, &key, now), Err(VerifyError::BadSignature));
    }

    #[test]
    fn rejects_missing_signature() {
        let key = crypto::hmac_key_from_token("session-abc");
        let now = Utc::now();
        let mut env = signed_envelope(&key, "typing", now);
        env.signature = None;
        assert_eq!(verify(&env, &key, now), Err(VerifyError::MissingFields));
    }
}
