//! Session resolution contract shared between the gateway and its
//! persistence backend.
//!
//! `Authenticator` is the abstract "resolveBearer" interface from §6.a:
//! the gateway crate depends only on this trait, never on `sqlx`
//! directly, so the connection-admission path can be driven by an
//! in-memory fake in tests (§8 seed scenarios) and by a Postgres-backed
//! implementation (`umbra-db::sessions::PgAuthenticator`) in production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Resolved identity of a bearer token, bound to exactly one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaim {
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub expires_at: DateTime<Utc>,
    /// Per-frame HMAC key derived from the session's own bearer token
    /// (§4.2) — every frame on this connection is signed and verified
    /// under this key, never the cluster-wide bus secret.
    pub hmac_key: [u8; 32],
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    #[error("device is not active or not bound to this user")]
    InactiveDevice,
}

/// Resolves an opaque bearer token to `(userId, deviceId, expiresAt)` and
/// verifies the bound device is active (§4.2 "Admission").
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<SessionClaim, AuthError>;

    /// Look up the primary device for a user (§4.9 `sync_request` routing).
    async fn primary_device_of(&self, user_id: Uuid) -> Option<Uuid>;
}
