//! Audit event repository (§4.2 "every such event is logged to the audit
//! sink", §7 `IntegrityFailure`).
//!
//! Kept separate from `tracing` output: tracing is for operators, this
//! table is for later forensic queries (e.g. "show me every replay attempt
//! against this device in the last 24h").

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn record(
    pool: &PgPool,
    user_id: Option<Uuid>,
    device_id: Option<Uuid>,
    event_type: &str,
    detail: Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO audit_events (id, user_id, device_id, event_type, detail, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(device_id)
    .bind(event_type)
    .bind(detail)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}
