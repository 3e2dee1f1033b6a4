//! User entity (§3.1).
//!
//! The core reads identity material only to hand it to clients
//! establishing sessions (X3DH key bundles); profile mutation is owned by
//! the external account-management service and is out of scope here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user account, as the routing core needs to see it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    /// SHA-256 hash of the verified phone number (external provisioning owns the raw number).
    pub phone_hash: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    /// Base64-encoded Ed25519 identity public key.
    pub identity_key_pub: String,
    /// Base64-encoded X25519 signed pre-key public key.
    pub signed_pre_key_pub: String,
    /// Base64-encoded Ed25519 signature over `signed_pre_key_pub`.
    pub signed_pre_key_sig: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
}

/// Privacy flags governing presence disclosure (§4.7), read by the
/// presence propagation layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::FromRow)]
pub struct PrivacySettings {
    pub user_id: Uuid,
    pub show_online_status: bool,
    pub show_read_receipts: bool,
    pub show_last_seen: bool,
    pub show_typing_indicator: bool,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            user_id: Uuid::nil(),
            show_online_status: true,
            show_read_receipts: true,
            show_last_seen: true,
            show_typing_indicator: true,
        }
    }
}
