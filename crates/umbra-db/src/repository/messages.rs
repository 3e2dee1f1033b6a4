//! Message repository (§3.1 `Message`, §4.11).
//!
//! `saveMessage` durably persists ciphertext before any `sent` ack is
//! returned to the sender (invariant 6, §3.2). Status transitions are
//! monotonic (`sent < delivered < read`); a regression is silently ignored
//! (invariant 2), implemented with a `CASE`-ranked guard rather than a
//! round trip to read-then-compare.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use umbra_common::models::message::{Message, MessageKind, MessageStatus};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SaveMessageError {
    #[error("recipient has blocked the sender")]
    Blocked,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub struct NewMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub ciphertext: Vec<u8>,
    pub message_type: MessageKind,
    pub media_id: Option<Uuid>,
    pub media_type: Option<String>,
    pub sealed_sender_certificate_id: Option<Uuid>,
}

/// Insert a message row with `status = sent`. Returns
/// [`SaveMessageError::Blocked`] instead of a raw FK violation when the
/// sender/receiver pair is blocked (§4.6 tie-breaks) — the gateway turns
/// this into an `error` frame to the sender.
pub async fn save_message(pool: &PgPool, msg: NewMessage) -> Result<Message, SaveMessageError> {
    let mut tx = pool.begin().await?;

    if let Some(receiver_id) = msg.receiver_id {
        let blocked: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM blocked_users
                WHERE (blocker_id = $1 AND blocked_id = $2)
                   OR (blocker_id = $2 AND blocked_id = $1)
            )
            "#,
        )
        .bind(receiver_id)
        .bind(msg.sender_id)
        .fetch_one(&mut *tx)
        .await?;

        if blocked {
            return Err(SaveMessageError::Blocked);
        }
    }

    let row = sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages (
            id, sender_id, receiver_id, group_id, ciphertext, message_type,
            media_id, media_type, timestamp, status, sealed_sender_certificate_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), 'sent', $9)
        RETURNING *
        "#,
    )
    .bind(msg.id)
    .bind(msg.sender_id)
    .bind(msg.receiver_id)
    .bind(msg.group_id)
    .bind(&msg.ciphertext)
    .bind(msg.message_type)
    .bind(msg.media_id)
    .bind(&msg.media_type)
    .bind(msg.sealed_sender_certificate_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

pub async fn get_message(pool: &PgPool, message_id: Uuid) -> Result<Option<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
        .bind(message_id)
        .fetch_optional(pool)
        .await
}

/// Monotonic status update (invariant 2, §3.2). A regression (e.g. `read`
/// arriving before a recorded `delivered`... the reverse direction) is a
/// silent no-op, expressed via a rank comparison in the `WHERE` clause.
pub async fn update_message_status(
    pool: &PgPool,
    message_id: Uuid,
    status: MessageStatus,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let rank = |s: MessageStatus| match s {
        MessageStatus::Sent => 0,
        MessageStatus::Delivered => 1,
        MessageStatus::Read => 2,
    };

    let (timestamp_column, new_rank) = match status {
        MessageStatus::Sent => ("timestamp", rank(status)),
        MessageStatus::Delivered => ("delivered_at", rank(status)),
        MessageStatus::Read => ("read_at", rank(status)),
    };

    let query = format!(
        r#"
        UPDATE messages SET
            status = $2,
            {timestamp_column} = $3
        WHERE id = $1
          AND (CASE status
                 WHEN 'sent' THEN 0
                 WHEN 'delivered' THEN 1
                 WHEN 'read' THEN 2
               END) < $4
        "#
    );

    sqlx::query(&query)
        .bind(message_id)
        .bind(status)
        .bind(at)
        .bind(new_rank)
        .execute(pool)
        .await?;
    Ok(())
}

/// Fallback path when a reconnecting device has no local session state
/// (primary path is the offline inbox, §4.11).
pub async fn get_pending_messages(pool: &PgPool, user_id: Uuid) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE receiver_id = $1 AND status = 'sent' ORDER BY timestamp ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Distinct peers this user has exchanged messages with — the contact set
/// used to scope presence propagation (§4.7).
pub async fn messaged_users(pool: &PgPool, user_id: Uuid) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT DISTINCT peer FROM (
            SELECT receiver_id AS peer FROM messages WHERE sender_id = $1 AND receiver_id IS NOT NULL
            UNION
            SELECT sender_id AS peer FROM messages WHERE receiver_id = $1
        ) peers
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}
