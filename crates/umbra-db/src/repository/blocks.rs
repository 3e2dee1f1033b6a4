//! Blocked-users repository (§6 persisted schema `blocked_users`).
//! Mutation is external (out of scope, §1); the core only reads it
//! indirectly through `messages::save_message`'s block check.

use sqlx::PgPool;
use uuid::Uuid;

pub async fn is_blocked(pool: &PgPool, blocker_id: Uuid, blocked_id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM blocked_users WHERE blocker_id = $1 AND blocked_id = $2)",
    )
    .bind(blocker_id)
    .bind(blocked_id)
    .fetch_one(pool)
    .await
}
