//! Offline inbox repository (§4.8).
//!
//! A per-user time-ordered queue keyed by `messageId`. The row here only
//! references the message; `messages` remains the source of truth for
//! ciphertext and status (§4.8 "Inbox is authoritative for delivery; the
//! persistent ciphertext row is the source of truth for history").

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use umbra_common::models::message::Message;
use uuid::Uuid;

pub async fn append(
    pool: &PgPool,
    user_id: Uuid,
    message_id: Uuid,
    enqueued_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO inbox_entries (user_id, message_id, enqueued_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id, message_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(message_id)
    .bind(enqueued_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fan-in for group offline delivery (§4.6 "bulk-insert one inbox entry
/// per user").
pub async fn append_many(
    pool: &PgPool,
    user_ids: &[Uuid],
    message_id: Uuid,
    enqueued_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    if user_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO inbox_entries (user_id, message_id, enqueued_at)
        SELECT u, $2, $3 FROM UNNEST($1::uuid[]) AS u
        ON CONFLICT (user_id, message_id) DO NOTHING
        "#,
    )
    .bind(user_ids)
    .bind(message_id)
    .bind(enqueued_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drain up to `batch_size` entries for a user, oldest-first, joined
/// against the durable message row so the gateway can reconstruct a
/// `deliver` frame directly.
pub async fn drain(pool: &PgPool, user_id: Uuid, batch_size: i64) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        r#"
        SELECT m.* FROM inbox_entries ie
        JOIN messages m ON m.id = ie.message_id
        WHERE ie.user_id = $1
        ORDER BY ie.enqueued_at ASC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(batch_size)
    .fetch_all(pool)
    .await
}

/// Remove entries after they've been handed to the send queue
/// (best-effort; duplicates are tolerated, §3.2 invariant 5).
pub async fn remove(pool: &PgPool, user_id: Uuid, message_ids: &[Uuid]) -> Result<(), sqlx::Error> {
    if message_ids.is_empty() {
        return Ok(());
    }
    sqlx::query("DELETE FROM inbox_entries WHERE user_id = $1 AND message_id = ANY($2)")
        .bind(user_id)
        .bind(message_ids)
        .execute(pool)
        .await?;
    Ok(())
}

/// Inbox depth for a user — backs the `/metrics` inbox-depth gauge (§6).
pub async fn depth(pool: &PgPool, user_id: Uuid) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM inbox_entries WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
}
