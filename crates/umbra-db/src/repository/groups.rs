//! Group repository (§3.1 `Group`/`GroupMember`, §4.11 `getGroupMembers`).
//! Membership mutation is external; the core only reads it for fan-out.

use sqlx::PgPool;
use umbra_common::models::group::{Group, GroupMember};
use uuid::Uuid;

pub async fn find_by_id(pool: &PgPool, group_id: Uuid) -> Result<Option<Group>, sqlx::Error> {
    sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE id = $1")
        .bind(group_id)
        .fetch_optional(pool)
        .await
}

pub async fn members(pool: &PgPool, group_id: Uuid) -> Result<Vec<GroupMember>, sqlx::Error> {
    sqlx::query_as::<_, GroupMember>("SELECT * FROM group_members WHERE group_id = $1")
        .bind(group_id)
        .fetch_all(pool)
        .await
}

/// Member user IDs excluding the given sender — the set the router fans
/// a group send out to (§4.6).
pub async fn member_ids_excluding(
    pool: &PgPool,
    group_id: Uuid,
    exclude: Uuid,
) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        "SELECT user_id FROM group_members WHERE group_id = $1 AND user_id <> $2",
    )
    .bind(group_id)
    .bind(exclude)
    .fetch_all(pool)
    .await
}
