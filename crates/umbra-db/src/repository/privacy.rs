//! Privacy settings repository (§4.11 `getPrivacySettings`) — governs
//! presence disclosure (ghost mode, last-seen visibility, §4.7).

use sqlx::PgPool;
use umbra_common::models::user::PrivacySettings;
use uuid::Uuid;

pub async fn get(pool: &PgPool, user_id: Uuid) -> Result<PrivacySettings, sqlx::Error> {
    let row = sqlx::query_as::<_, PrivacySettings>(
        "SELECT * FROM privacy_settings WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.unwrap_or(PrivacySettings {
        user_id,
        ..PrivacySettings::default()
    }))
}
