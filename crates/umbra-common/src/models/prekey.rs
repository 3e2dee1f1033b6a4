//! PreKey / SignedPreKey entities (§3.1).
//!
//! One-time pre-keys are public material consumed exactly once on first
//! session setup. Consumption must be atomic — two concurrent session
//! setups must never receive the same prekey (`FOR UPDATE SKIP LOCKED`,
//! enforced by `umbra-db::repository::prekeys`, not by this type).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A one-time pre-key uploaded by a device.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PreKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub prekey_id: i32,
    pub public_key: String,
    pub used_at: Option<DateTime<Utc>>,
}

/// A device's current signed pre-key (rotated periodically by the client).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignedPreKey {
    pub device_id: Uuid,
    pub signed_prekey_id: i32,
    pub public_key: String,
    /// Base64-encoded Ed25519 signature over `public_key` by the device's identity key.
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// Full key bundle returned to an initiator establishing a session (X3DH).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBundle {
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub identity_key: String,
    pub signed_prekey: SignedPreKey,
    /// May be `None` if the server has run out of one-time pre-keys for this device.
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub prekey_id: i32,
    pub public_key: String,
}
