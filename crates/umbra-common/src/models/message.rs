//! Message (ciphertext envelope) entity (§3.1).
//!
//! Created by the send handler; mutated only by status transitions in the
//! forward direction `sent → delivered → read`; ciphertext bytes are
//! opaque to the core and never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Prekey,
    Whisper,
}

/// Delivery status. Ordered: `Sent < Delivered < Read`. Regression must be
/// silently ignored by the persistence layer (invariant 2, §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

/// Either a 1:1 recipient or a group target — never both, never neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    User(Uuid),
    Group(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub ciphertext: Vec<u8>,
    pub message_type: MessageKind,
    pub media_id: Option<Uuid>,
    pub media_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub sealed_sender_certificate_id: Option<Uuid>,
}

impl Message {
    pub fn target(&self) -> Option<MessageTarget> {
        match (self.receiver_id, self.group_id) {
            (Some(u), None) => Some(MessageTarget::User(u)),
            (None, Some(g)) => Some(MessageTarget::Group(g)),
            _ => None,
        }
    }
}
