//! PreKey / SignedPreKey repository (§3.1, §4.11 `getUserKeys`).
//!
//! One-time prekey consumption is a single-row claim under
//! `FOR UPDATE SKIP LOCKED` so two concurrent session setups never
//! receive the same prekey (§3.1 invariant, §4.11 obligation).

use sqlx::PgPool;
use umbra_common::models::prekey::{KeyBundle, OneTimePreKeyPublic, SignedPreKey};
use uuid::Uuid;

/// Claim and mark-used one unconsumed one-time prekey for a device, if any
/// remain.
async fn claim_one_time_prekey(
    pool: &PgPool,
    device_id: Uuid,
) -> Result<Option<OneTimePreKeyPublic>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query_as::<_, (i32, String)>(
        r#"
        SELECT prekey_id, public_key FROM prekeys
        WHERE device_id = $1 AND used_at IS NULL
        ORDER BY prekey_id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        "#,
    )
    .bind(device_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((prekey_id, public_key)) = claimed else {
        tx.commit().await?;
        return Ok(None);
    };

    sqlx::query("UPDATE prekeys SET used_at = NOW() WHERE device_id = $1 AND prekey_id = $2")
        .bind(device_id)
        .bind(prekey_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Some(OneTimePreKeyPublic { prekey_id, public_key }))
}

/// Full key bundle for an initiator establishing a session with
/// `(user_id, device_id)` via X3DH. `one_time_prekey` is `None` if the
/// device has run out (a session can still be established, just without
/// the extra forward-secrecy round).
pub async fn user_key_bundle(
    pool: &PgPool,
    user_id: Uuid,
    device_id: Uuid,
    identity_key: &str,
) -> Result<Option<KeyBundle>, sqlx::Error> {
    let signed_prekey = sqlx::query_as::<_, SignedPreKey>(
        "SELECT * FROM signed_prekeys WHERE device_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    let Some(signed_prekey) = signed_prekey else {
        return Ok(None);
    };

    let one_time_prekey = claim_one_time_prekey(pool, device_id).await?;

    Ok(Some(KeyBundle {
        user_id,
        device_id,
        identity_key: identity_key.to_owned(),
        signed_prekey,
        one_time_prekey,
    }))
}

pub async fn bulk_insert_one_time(
    pool: &PgPool,
    device_id: Uuid,
    user_id: Uuid,
    keys: &[(i32, String)],
) -> Result<(), sqlx::Error> {
    for (prekey_id, public_key) in keys {
        sqlx::query(
            r#"
            INSERT INTO prekeys (id, user_id, device_id, prekey_id, public_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_id, prekey_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(device_id)
        .bind(prekey_id)
        .bind(public_key)
        .execute(pool)
        .await?;
    }
    Ok(())
}
