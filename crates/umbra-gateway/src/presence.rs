//! Presence policy (§4.7) — ghost mode, contact-set scoping, and
//! loop avoidance layered on top of `umbra_db::presence`'s raw Redis ops.
//!
//! Raw online/connection-route bookkeeping knows nothing about privacy or
//! which other users care; this module is what decides *whether* and *to
//! whom* a presence change gets announced.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use umbra_db::bus::Bus;
use umbra_db::Database;
use uuid::Uuid;

use crate::frame::{Envelope, PresenceEventPayload};

/// Wire shape published on the `presence` bus channel — every node
/// subscribes and relays to its own locally-connected contacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceBroadcast {
    pub user_id: Uuid,
    pub online: bool,
    /// Present only when `online` is false and the user allows last-seen
    /// disclosure; absent under ghost mode (§4.7).
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
    /// Origin node, so a node that already applied the change locally
    /// doesn't re-broadcast it back to itself (loop avoidance, §4.7).
    pub server_id: String,
}

pub struct PresencePolicy {
    db: Arc<Database>,
    bus: Arc<dyn Bus>,
    server_id: String,
    presence_ttl_secs: u64,
    online_ttl_secs: u64,
}

impl PresencePolicy {
    pub fn new(db: Arc<Database>, bus: Arc<dyn Bus>, server_id: String, presence_ttl_secs: u64, online_ttl_secs: u64) -> Self {
        Self { db, bus, server_id, presence_ttl_secs, online_ttl_secs }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Called by the hub right after a connection is admitted.
    /// `first_device` is true only when this user had no other local or
    /// remote connection before this one (offline → online transition).
    ///
    /// Returns the event that was published to the bus (for other nodes)
    /// so the caller can also deliver it to this node's own
    /// locally-connected contacts — the bus relay drops self-originated
    /// events (loop avoidance, §4.7), so the origin node is responsible
    /// for its own local fan-out.
    pub async fn on_register(&self, user_id: Uuid, device_id: Uuid, first_device: bool) -> Option<PresenceBroadcast> {
        if let Some(mut conn) = self.db.redis.clone() {
            let _ = umbra_db::presence::set_online(&mut conn, user_id, self.online_ttl_secs).await;
            let _ = umbra_db::presence::set_connection_route(
                &mut conn,
                user_id,
                device_id,
                &self.server_id,
                self.presence_ttl_secs,
            )
            .await;
        }

        if !first_device {
            return None;
        }

        if !self.shows_online_status(user_id).await {
            return None; // ghost mode: no announcement at all
        }

        let event = PresenceBroadcast {
            user_id,
            online: true,
            last_seen: None,
            server_id: self.server_id.clone(),
        };
        self.broadcast(event.clone()).await;
        Some(event)
    }

    /// Called by the hub after a connection is torn down. `last_device` is
    /// true when no other connection for this user remains anywhere. See
    /// [`Self::on_register`] for why the event is also returned.
    pub async fn on_unregister(&self, user_id: Uuid, device_id: Uuid, last_device: bool) -> Option<PresenceBroadcast> {
        if let Some(mut conn) = self.db.redis.clone() {
            let _ = umbra_db::presence::remove_connection_route(&mut conn, user_id, device_id).await;
        }

        if !last_device {
            return None;
        }

        if let Some(mut conn) = self.db.redis.clone() {
            let _ = umbra_db::presence::set_offline(&mut conn, user_id).await;
        }

        if !self.shows_online_status(user_id).await {
            return None;
        }

        let last_seen = if self.shows_last_seen(user_id).await {
            Some(chrono::Utc::now())
        } else {
            None
        };

        let event = PresenceBroadcast {
            user_id,
            online: false,
            last_seen,
            server_id: self.server_id.clone(),
        };
        self.broadcast(event.clone()).await;
        Some(event)
    }

    /// Refresh the TTLs that back the online bit and connection route on
    /// every heartbeat (§4.7 "refreshed on heartbeat").
    pub async fn refresh_heartbeat(&self, user_id: Uuid, device_id: Uuid) {
        if let Some(mut conn) = self.db.redis.clone() {
            let _ = umbra_db::presence::set_online(&mut conn, user_id, self.online_ttl_secs).await;
            let _ = umbra_db::presence::set_connection_route(
                &mut conn,
                user_id,
                device_id,
                &self.server_id,
                self.presence_ttl_secs,
            )
            .await;
        }
    }

    /// Is the user online anywhere in the cluster right now? Used by the
    /// router to decide between local/remote/offline delivery (§4.6).
    pub async fn is_online(&self, user_id: Uuid) -> bool {
        match self.db.redis.clone() {
            Some(mut conn) => umbra_db::presence::is_online(&mut conn, user_id).await.unwrap_or(false),
            None => false,
        }
    }

    /// Peers who have exchanged messages with `user_id` — the scope a
    /// presence change is announced to (§4.7).
    pub async fn contacts_of(&self, user_id: Uuid) -> Vec<Uuid> {
        umbra_db::repository::messages::messaged_users(&self.db.pg, user_id)
            .await
            .unwrap_or_default()
    }

    async fn shows_online_status(&self, user_id: Uuid) -> bool {
        umbra_db::repository::privacy::get(&self.db.pg, user_id)
            .await
            .map(|p| p.show_online_status)
            .unwrap_or(true)
    }

    async fn shows_last_seen(&self, user_id: Uuid) -> bool {
        umbra_db::repository::privacy::get(&self.db.pg, user_id)
            .await
            .map(|p| p.show_last_seen)
            .unwrap_or(true)
    }

    async fn broadcast(&self, event: PresenceBroadcast) {
        let Ok(bytes) = serde_json::to_vec(&event) else { return };
        if let Err(e) = self.bus.publish("presence", &bytes).await {
            tracing::warn!(error = %e, user_id = %event.user_id, "failed to publish presence broadcast");
        }
    }
}

/// Build the `user_online` / `user_offline` frame relayed to a contact's
/// local devices once a [`PresenceBroadcast`] is received (§4.1, §4.7).
pub fn presence_envelope(event: &PresenceBroadcast) -> Envelope {
    let frame_type = if event.online { "user_online" } else { "user_offline" };
    let payload = PresenceEventPayload {
        user_id: event.user_id,
        last_seen: event.last_seen,
    };
    Envelope {
        frame_type: frame_type.to_owned(),
        message_id: None,
        sender_id: Some(event.user_id),
        device_id: None,
        server_id: Some(event.server_id.clone()),
        timestamp: Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        payload: crate::frame::raw_payload(&payload),
        signature: None,
        nonce: None,
        relay_targets: None,    }
}
