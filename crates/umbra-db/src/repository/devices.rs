//! Device repository (§3.1 `Device`, §4.11 `getPrimaryDevice`).
//!
//! Invariant enforced here: a user has at most one active primary device;
//! if the primary is deactivated, the oldest remaining active device is
//! promoted in the same transaction.

use sqlx::{PgPool, Postgres, Transaction};
use umbra_common::models::device::Device;
use uuid::Uuid;

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn primary_device_of(pool: &PgPool, user_id: Uuid) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM devices WHERE user_id = $1 AND is_primary = true AND active = true",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_active(pool: &PgPool, user_id: Uuid) -> Result<Vec<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE user_id = $1 AND active = true ORDER BY registered_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

pub async fn touch_last_seen(pool: &PgPool, device_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE devices SET last_seen = NOW() WHERE id = $1")
        .bind(device_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Deactivate a device, promoting the oldest remaining active device to
/// primary if the deactivated one was primary and no other primary exists.
pub async fn deactivate(pool: &PgPool, device_id: Uuid, user_id: Uuid) -> Result<(), sqlx::Error> {
    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;

    sqlx::query("UPDATE devices SET active = false, is_primary = false WHERE id = $1")
        .bind(device_id)
        .execute(&mut *tx)
        .await?;

    let has_primary: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM devices WHERE user_id = $1 AND is_primary = true AND active = true)",
    )
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;

    if !has_primary {
        sqlx::query(
            r#"
            UPDATE devices SET is_primary = true
            WHERE id = (
                SELECT id FROM devices
                WHERE user_id = $1 AND active = true
                ORDER BY registered_at ASC
                LIMIT 1
            )
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}
