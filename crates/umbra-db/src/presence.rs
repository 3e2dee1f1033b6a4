//! Raw presence operations against the external key-value store (§4.7).
//!
//! Three logical maps, all TTL'd and refreshed on heartbeat:
//!
//! - `online:{userId} → bool`, TTL `onlineTtlSecs` (120 s default).
//! - `conn:{userId} → {deviceId → nodeId}`, per-entry TTL `presenceTtlSecs`
//!   (60 s default).
//! - the `presence` pub/sub channel, owned by [`crate::bus`].
//!
//! This module only talks to Redis; it knows nothing about ghost mode or
//! contact-set filtering — that policy lives in `umbra-gateway::presence`,
//! which is the domain-aware caller of these operations.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

fn online_key(user_id: Uuid) -> String {
    format!("online:{user_id}")
}

fn conn_key(user_id: Uuid) -> String {
    format!("conn:{user_id}")
}

/// Mark a user online, refreshing the TTL.
pub async fn set_online(
    conn: &mut ConnectionManager,
    user_id: Uuid,
    ttl_secs: u64,
) -> Result<(), redis::RedisError> {
    conn.set_ex(online_key(user_id), "1", ttl_secs).await
}

/// Clear the online bit (on full unregister, §4.5).
pub async fn set_offline(conn: &mut ConnectionManager, user_id: Uuid) -> Result<(), redis::RedisError> {
    conn.del(online_key(user_id)).await
}

/// Is the user's online bit currently set (not expired)?
pub async fn is_online(conn: &mut ConnectionManager, user_id: Uuid) -> Result<bool, redis::RedisError> {
    conn.exists(online_key(user_id)).await
}

/// Record `{deviceId → nodeId}` for a connection, TTL'd independently per
/// field via the hash-field-expire dance: we store as a JSON blob keyed by
/// device inside a single hash and rely on the caller to refresh on
/// heartbeat, matching the "per-entry TTL" language in §4.7 at the
/// granularity Redis hashes actually support (whole-key TTL, refreshed on
/// every heartbeat touching any device of that user).
pub async fn set_connection_route(
    conn: &mut ConnectionManager,
    user_id: Uuid,
    device_id: Uuid,
    node_id: &str,
    ttl_secs: u64,
) -> Result<(), redis::RedisError> {
    let key = conn_key(user_id);
    conn.hset(&key, device_id.to_string(), node_id).await?;
    conn.expire(&key, ttl_secs as i64).await
}

/// Remove a single device's route. If no routes remain, the hash key
/// disappears naturally (empty hash deleted by Redis) and `is_online`
/// should no longer be relied upon — the hub additionally clears the
/// online bit explicitly when the last device unregisters.
pub async fn remove_connection_route(
    conn: &mut ConnectionManager,
    user_id: Uuid,
    device_id: Uuid,
) -> Result<(), redis::RedisError> {
    conn.hdel(conn_key(user_id), device_id.to_string()).await
}

/// All known `{deviceId → nodeId}` routes for a user.
pub async fn connection_routes(
    conn: &mut ConnectionManager,
    user_id: Uuid,
) -> Result<Vec<(Uuid, String)>, redis::RedisError> {
    let raw: std::collections::HashMap<String, String> = conn.hgetall(conn_key(user_id)).await?;
    Ok(raw
        .into_iter()
        .filter_map(|(device, node)| Uuid::parse_str(&device).ok().map(|d| (d, node)))
        .collect())
}

/// Does the user have any live routes at all, on any node?
pub async fn has_any_route(conn: &mut ConnectionManager, user_id: Uuid) -> Result<bool, redis::RedisError> {
    let count: i64 = conn.hlen(conn_key(user_id)).await?;
    Ok(count > 0)
}
