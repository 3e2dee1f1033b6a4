//! Frame codec & envelope (§4.1).
//!
//! Transport-independent so it can be unit-tested without a socket. The
//! `payload` field is kept as a [`RawValue`] rather than deserialized
//! eagerly: the HMAC canonical string (§4.2) is built over the *exact*
//! bytes the client transmitted, and re-serializing a parsed `Value`
//! would not reliably reproduce them (key order, whitespace). Callers that
//! need a typed payload parse it out of the raw bytes themselves, with
//! [`Envelope::payload_json`] giving them the same bytes the verifier saw.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// Hard cap on frame size (§4.1). Frames larger than this terminate the
/// connection rather than producing an in-band error.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// All frame types recognized on the wire (§4.1). Anything else is a
/// `ValidationFailure` (`UnknownFrameType`), not a decode error — the
/// envelope still parses, only dispatch rejects it.
pub const RECOGNIZED_TYPES: &[&str] = &[
    "send",
    "sent_ack",
    "deliver",
    "delivery_ack",
    "read_receipt",
    "status_update",
    "typing",
    "heartbeat",
    "heartbeat_ack",
    "user_online",
    "user_offline",
    "call_offer",
    "call_answer",
    "call_reject",
    "call_end",
    "call_busy",
    "ice_candidate",
    "sync_request",
    "sync_data",
    "sync_ack",
    "media_key",
    "error",
];

pub fn is_recognized(frame_type: &str) -> bool {
    RECOGNIZED_TYPES.contains(&frame_type)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds the maximum size of {limit} bytes")]
    TooLarge { limit: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// The JSON envelope carried by every WebSocket frame (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub message_id: Option<Uuid>,
    /// Server-filled from the authenticated connection; client-supplied
    /// values are ignored on the inbound path (§4.1).
    pub sender_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    /// Server-originated presence events only.
    pub server_id: Option<String>,
    /// ISO-8601 UTC, millisecond precision: `YYYY-MM-DDThh:mm:ss.sssZ`.
    pub timestamp: Option<String>,
    pub payload: Box<RawValue>,
    /// Hex-encoded 256-bit HMAC. Absent on `error`/`heartbeat_ack` frames
    /// originating at the server (§4.2).
    pub signature: Option<String>,
    /// Hex string, ≥ 128 bits entropy.
    pub nonce: Option<String>,
    /// Transport-internal addressing for bus-relayed frames (§4.10):
    /// which local users a receiving node should deliver this frame to.
    /// Never set on a client-originated frame; stripped before the final
    /// hop to a device (clients never see it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_targets: Option<Vec<Uuid>>,
}

impl Envelope {
    /// Decode a single frame, rejecting anything over [`MAX_FRAME_BYTES`]
    /// before even touching the JSON parser.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge { limit: MAX_FRAME_BYTES });
        }
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The exact payload bytes as received — the same bytes the HMAC
    /// canonical string is built from.
    pub fn payload_json(&self) -> &str {
        self.payload.get()
    }

    pub fn parse_payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.payload.get())
    }
}

pub fn raw_payload<T: Serialize>(value: &T) -> Box<RawValue> {
    RawValue::from_string(serde_json::to_string(value).expect("payload serializes"))
        .expect("serde_json output is valid JSON")
}

/// Base64-decode a `send` payload's `ciphertext` field.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, FrameError> {
    umbra_common::crypto::from_base64(encoded).ok_or(FrameError::MissingField("ciphertext"))
}

/// Base64-encode a stored message's ciphertext for the `deliver` payload.
pub fn encode_base64(bytes: &[u8]) -> String {
    umbra_common::crypto::to_base64(bytes)
}

/// `now` in the wire timestamp format (§4.1): `YYYY-MM-DDThh:mm:ss.sssZ`.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ============================================================
// Typed payload contracts (§4.1)
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPayload {
    pub receiver_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    /// Base64-encoded ciphertext.
    pub ciphertext: String,
    pub message_type: umbra_common::models::message::MessageKind,
    pub prekey_id: Option<i32>,
    pub signed_prekey_id: Option<i32>,
    pub identity_key: Option<String>,
    pub base_key: Option<String>,
    pub media_id: Option<Uuid>,
    pub media_type: Option<String>,
    pub sealed_sender_certificate_id: Option<Uuid>,
    pub ephemeral_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentAckPayload {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAckPayload {
    pub message_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    pub status: String,
    pub message_id: Option<Uuid>,
    pub delivered_to: Option<u32>,
    pub pending: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub receiver_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEventPayload {
    pub user_id: Uuid,
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

/// Call signalling payloads declare `target_id`, with `recipient_id`
/// accepted as a legacy alias (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPayload {
    pub target_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
}

impl CallPayload {
    pub fn target(&self) -> Option<Uuid> {
        self.target_id.or(self.recipient_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallBusyPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTargetPayload {
    pub target_device_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaKeyPayload {
    pub recipient_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(frame_type: &str, payload: &str) -> Vec<u8> {
        format!(
            r#"{{"type":"{frame_type}","message_id":null,"sender_id":null,"device_id":null,
               "server_id":null,"timestamp":"2024-01-15T10:30:00.000Z","payload":{payload},
               "signature":"ab","nonce":"cd"}}"#
        )
        .into_bytes()
    }

    #[test]
    fn decodes_send_with_receiver() {
        let bytes = envelope(
            "send",
            r#"{"receiver_id":"2e6d4a2e-8e63-4b4e-9b8a-111111111111","ciphertext":"Zm9v","message_type":"whisper"}"#,
        );
        let env = Envelope::decode(&bytes).unwrap();
        assert_eq!(env.frame_type, "send");
        let payload: SendPayload = env.parse_payload().unwrap();
        assert!(payload.receiver_id.is_some());
        assert!(payload.group_id.is_none());
    }

    #[test]
    fn decodes_send_with_sealed_sender() {
        let bytes = envelope(
            "send",
            r#"{"group_id":"2e6d4a2e-8e63-4b4e-9b8a-222222222222","ciphertext":"Zm9v","message_type":"prekey","sealed_sender_certificate_id":"2e6d4a2e-8e63-4b4e-9b8a-333333333333"}"#,
        );
        let env = Envelope::decode(&bytes).unwrap();
        let payload: SendPayload = env.parse_payload().unwrap();
        assert!(payload.group_id.is_some());
        assert!(payload.sealed_sender_certificate_id.is_some());
    }

    #[test]
    fn rejects_oversize_frame() {
        let huge = vec![b'a'; MAX_FRAME_BYTES + 1];
        match Envelope::decode(&huge) {
            Err(FrameError::TooLarge { limit }) => assert_eq!(limit, MAX_FRAME_BYTES),
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_type_still_decodes() {
        let bytes = envelope("not_a_real_type", "{}");
        let env = Envelope::decode(&bytes).unwrap();
        assert!(!is_recognized(&env.frame_type));
    }

    #[test]
    fn payload_json_preserves_exact_bytes() {
        let bytes = envelope("heartbeat", r#"{"b":2,"a":1}"#);
        let env = Envelope::decode(&bytes).unwrap();
        assert_eq!(env.payload_json(), r#"{"b":2,"a":1}"#);
    }
}
