//! Postgres-backed [`Authenticator`] (§4.2 "Admission", §6.a `resolveBearer`).
//!
//! Bearer tokens are never stored in plaintext — only a salted SHA-256
//! digest, so a database leak doesn't hand out live sessions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use umbra_common::auth::{AuthError, Authenticator, SessionClaim};
use umbra_common::crypto;
use uuid::Uuid;

pub struct PgAuthenticator {
    pool: PgPool,
}

impl PgAuthenticator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    user_id: Uuid,
    device_id: Uuid,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    device_active: bool,
}

#[async_trait]
impl Authenticator for PgAuthenticator {
    async fn resolve(&self, token: &str) -> Result<SessionClaim, AuthError> {
        let fingerprint = token_fingerprint(token);

        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT s.user_id, s.device_id, s.expires_at, s.revoked_at, d.active AS device_active
            FROM sessions s
            JOIN devices d ON d.id = s.device_id AND d.user_id = s.user_id
            WHERE s.token_fingerprint = $1
            "#,
        )
        .bind(&fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "session lookup failed");
            AuthError::NotFound
        })?
        .ok_or(AuthError::NotFound)?;

        if row.revoked_at.is_some() {
            return Err(AuthError::Revoked);
        }
        if row.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        if !row.device_active {
            return Err(AuthError::InactiveDevice);
        }

        Ok(SessionClaim {
            user_id: row.user_id,
            device_id: row.device_id,
            expires_at: row.expires_at,
            hmac_key: crypto::hmac_key_from_token(token),
        })
    }

    async fn primary_device_of(&self, user_id: Uuid) -> Option<Uuid> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM devices WHERE user_id = $1 AND is_primary = true AND active = true",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
    }
}
