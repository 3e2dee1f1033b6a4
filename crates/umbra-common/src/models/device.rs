//! Device entity (§3.1).
//!
//! Invariant: a user always has at most one active primary device; if
//! none exists, the oldest active device is promoted (enforced by
//! `umbra-db::repository::devices`, not by this type).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
    Web,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_name: Option<String>,
    pub device_type: DeviceType,
    /// Base64-encoded public key identifying this device.
    pub device_pub_key: String,
    pub is_primary: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
}
