//! Router & group fan-out (§4.6), offline inbox wiring (§4.8), and
//! signalling relays (§4.9).
//!
//! Every handler here runs after HMAC/nonce verification (or, for
//! [`Router::handle_remote`], after the equivalent trust boundary was
//! already crossed on the originating node) — nothing in this module
//! re-checks frame integrity.

use std::sync::Arc;

use serde_json::json;
use serde_json::value::RawValue;
use umbra_common::auth::Authenticator;
use umbra_common::config::AppConfig;
use umbra_common::models::message::MessageStatus;
use umbra_db::bus::Bus;
use umbra_db::repository::{audit, groups, inbox, messages};
use umbra_db::Database;
use uuid::Uuid;

use crate::connection::ConnHandle;
use crate::frame::{
    self, CallBusyPayload, CallPayload, DeliveryAckPayload, Envelope, ErrorPayload, MediaKeyPayload,
    ReadReceiptPayload, SendPayload, SentAckPayload, StatusUpdatePayload, SyncTargetPayload, TypingPayload,
};
use crate::hub::HubView;
use crate::jobs::{Job, JobQueue};
use crate::presence::PresencePolicy;

pub struct Router {
    db: Arc<Database>,
    bus: Arc<dyn Bus>,
    presence: Arc<PresencePolicy>,
    auth: Arc<dyn Authenticator>,
    config: Arc<AppConfig>,
    jobs: Arc<dyn JobQueue>,
}

impl Router {
    pub fn new(
        db: Arc<Database>,
        bus: Arc<dyn Bus>,
        presence: Arc<PresencePolicy>,
        auth: Arc<dyn Authenticator>,
        config: Arc<AppConfig>,
        jobs: Arc<dyn JobQueue>,
    ) -> Self {
        Self { db, bus, presence, auth, config, jobs }
    }

    pub async fn handle(&self, user_id: Uuid, device_id: Uuid, envelope: Envelope, hub: HubView<'_>) {
        let result = match envelope.frame_type.as_str() {
            "send" => self.handle_send(user_id, device_id, &envelope, &hub).await,
            "delivery_ack" => self.handle_delivery_ack(user_id, &envelope).await,
            "read_receipt" => self.handle_read_receipt(user_id, &envelope).await,
            "typing" => self.handle_typing(user_id, &envelope, &hub).await,
            "call_offer" | "call_answer" | "call_reject" | "call_end" => {
                self.handle_call(user_id, device_id, &envelope, &hub).await
            }
            "sync_request" => self.handle_sync_request(user_id, device_id, &envelope, &hub).await,
            "sync_data" | "sync_ack" => self.handle_sync_targeted(user_id, &envelope, &hub).await,
            "media_key" => self.handle_media_key(user_id, &envelope, &hub).await,
            other => {
                tracing::debug!(frame_type = other, "no inbound handler for this frame type");
                Ok(())
            }
        };

        if let Err(message) = result {
            self.reply_error(user_id, device_id, &hub, &message);
        }
    }

    /// A frame injected from the bus (§4.10) — already trusted, so it goes
    /// straight to local delivery without re-entering `handle`'s type
    /// dispatch (the originating node already ran that). The publishing
    /// node stamps `relay_targets` with the local user ids this node owns
    /// a route for; that field never reaches a client.
    pub async fn handle_remote(&self, envelope: Envelope, hub: HubView<'_>) {
        let Some(targets) = envelope.relay_targets.clone() else {
            tracing::warn!(frame_type = %envelope.frame_type, "remote frame missing relay_targets, dropping");
            return;
        };
        let outgoing = Envelope { relay_targets: None, ..envelope };
        let Ok(bytes) = outgoing.encode() else { return };
        for user_id in targets {
            for conn in hub.local_devices(user_id) {
                let _ = conn.try_send(bytes.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // send / acks
    // ------------------------------------------------------------------

    async fn handle_send(&self, user_id: Uuid, device_id: Uuid, envelope: &Envelope, hub: &HubView<'_>) -> Result<(), String> {
        let payload: SendPayload = envelope
            .parse_payload()
            .map_err(|_| "malformed send payload".to_owned())?;

        let (receiver_id, group_id) = (payload.receiver_id, payload.group_id);
        if receiver_id.is_none() && group_id.is_none() {
            return Err("message must target a receiver or a group".to_owned());
        }

        let message_id = envelope.message_id.unwrap_or_else(Uuid::new_v4);
        let ciphertext = frame::decode_base64(&payload.ciphertext).map_err(|_| "ciphertext is not valid base64".to_owned())?;

        let new_message = messages::NewMessage {
            id: message_id,
            sender_id: user_id,
            receiver_id,
            group_id,
            ciphertext,
            message_type: payload.message_type,
            media_id: payload.media_id,
            media_type: payload.media_type.clone(),
            sealed_sender_certificate_id: payload.sealed_sender_certificate_id,
        };

        let saved = match messages::save_message(&self.db.pg, new_message).await {
            Ok(m) => m,
            Err(messages::SaveMessageError::Blocked) => return Err("recipient is unavailable".to_owned()),
            Err(messages::SaveMessageError::Db(e)) => {
                tracing::error!(error = %e, "save_message failed");
                return Err("message could not be stored".to_owned());
            }
        };

        self.send_sent_ack(user_id, device_id, hub);

        if let Some(group_id) = group_id {
            self.fan_out_group(user_id, group_id, message_id, hub).await;
        } else if let Some(receiver_id) = receiver_id {
            let deliver = build_deliver_envelope(&saved, envelope.payload.clone());
            let exclude_device = if receiver_id == user_id { Some(device_id) } else { None };
            self.route_to_user(receiver_id, &deliver, exclude_device, hub).await;
        }

        self.jobs.enqueue(Job::Archive { message_id });
        Ok(())
    }

    fn send_sent_ack(&self, user_id: Uuid, originating_device: Uuid, hub: &HubView<'_>) {
        let ack = Envelope {
            frame_type: "sent_ack".to_owned(),
            message_id: None,
            sender_id: None,
            device_id: None,
            server_id: None,
            timestamp: Some(frame::now_iso()),
            payload: frame::raw_payload(&SentAckPayload { status: "sent".to_owned() }),
            signature: None,
            nonce: None,
            relay_targets: None,        };
        for conn in hub.local_devices(user_id) {
            if conn.device_id != originating_device {
                if let Ok(bytes) = ack.encode() {
                    let _ = conn.try_send(bytes);
                }
            }
        }
    }

    /// Direct-send routing: local, remote-node, or offline (§4.6 tie-breaks).
    /// `exclude_device` drops the sending device from local delivery on a
    /// self-send, so a device never gets its own outbound message echoed
    /// back as a `deliver` frame.
    async fn route_to_user(&self, user_id: Uuid, deliver: &Envelope, exclude_device: Option<Uuid>, hub: &HubView<'_>) {
        let local = hub.local_devices(user_id);
        if !local.is_empty() {
            // The recipient has a live local connection, so this send is
            // resolved here one way or another — never fall through to
            // remote/offline routing even if every local device was the
            // excluded originating one.
            let targets: Vec<_> = match exclude_device {
                Some(device_id) => local.into_iter().filter(|c| c.device_id != device_id).collect(),
                None => local,
            };
            if !targets.is_empty() {
                deliver_local(&targets, deliver);
            }
            return;
        }

        if self.presence.is_online(user_id).await {
            if let Some(mut conn) = self.db.redis.clone() {
                if let Ok(routes) = umbra_db::presence::connection_routes(&mut conn, user_id).await {
                    if !routes.is_empty() {
                        self.publish_to_nodes(&routes, user_id, deliver).await;
                        return;
                    }
                }
            }
            // Appears online but no route resolved — treat as offline.
        }

        self.store_offline(user_id, deliver).await;
    }

    /// Publish `envelope` to every distinct node in `routes`, tagging it
    /// with `relay_targets = [user_id]` so the receiving node knows which
    /// local user to deliver to without re-parsing application payload
    /// (§4.10).
    async fn publish_to_nodes(&self, routes: &[(Uuid, String)], user_id: Uuid, envelope: &Envelope) {
        let tagged = Envelope { relay_targets: Some(vec![user_id]), ..envelope.clone() };
        let mut seen = std::collections::HashSet::new();
        for (_, node_id) in routes {
            if !seen.insert(node_id.clone()) {
                continue;
            }
            if let Ok(bytes) = tagged.encode() {
                if let Err(e) = self.bus.publish(&format!("node:{node_id}"), &bytes).await {
                    tracing::warn!(error = %e, node_id, "failed to publish to remote node");
                }
            }
        }
    }

    async fn store_offline(&self, user_id: Uuid, deliver: &Envelope) {
        let Some(message_id) = deliver.message_id else { return };
        match inbox::append(&self.db.pg, user_id, message_id, chrono::Utc::now()).await {
            Ok(()) => metrics::gauge!("umbra_inbox_depth").increment(1.0),
            Err(e) => tracing::error!(error = %e, "inbox append failed"),
        }
        self.publish_notification(user_id, message_id).await;
        self.jobs.enqueue(Job::PendingDelivery { user_id, message_id });
    }

    async fn publish_notification(&self, user_id: Uuid, message_id: Uuid) {
        let payload = json!({ "message_id": message_id });
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            let _ = self.bus.publish(&format!("notifications:{user_id}"), &bytes).await;
        }
    }

    // ------------------------------------------------------------------
    // group fan-out
    // ------------------------------------------------------------------

    async fn fan_out_group(&self, sender_id: Uuid, group_id: Uuid, message_id: Uuid, hub: &HubView<'_>) {
        let Ok(Some(saved)) = messages::get_message(&self.db.pg, message_id).await else {
            return;
        };
        let members = groups::member_ids_excluding(&self.db.pg, group_id, sender_id).await.unwrap_or_default();

        let mut delivered_to = 0u32;
        let mut pending = 0u32;
        let mut offline_members = Vec::new();
        let mut by_node: std::collections::HashMap<String, Vec<Uuid>> = std::collections::HashMap::new();

        for member_id in members {
            let local = hub.local_devices(member_id);
            if !local.is_empty() {
                let deliver = build_deliver_envelope(&saved, deliver_payload_from_message(&saved));
                deliver_local(&local, &deliver);
                delivered_to += 1;
                continue;
            }

            if self.presence.is_online(member_id).await {
                if let Some(mut conn) = self.db.redis.clone() {
                    if let Ok(routes) = umbra_db::presence::connection_routes(&mut conn, member_id).await {
                        if !routes.is_empty() {
                            for (_, node_id) in routes {
                                by_node.entry(node_id).or_default().push(member_id);
                            }
                            delivered_to += 1;
                            continue;
                        }
                    }
                }
            }

            offline_members.push(member_id);
            pending += 1;
        }

        for (node_id, member_ids) in by_node {
            let mut deliver = build_deliver_envelope(&saved, deliver_payload_from_message(&saved));
            deliver.relay_targets = Some(member_ids);
            if let Ok(bytes) = deliver.encode() {
                let _ = self.bus.publish(&format!("node:{node_id}"), &bytes).await;
            }
        }

        if !offline_members.is_empty() {
            match inbox::append_many(&self.db.pg, &offline_members, message_id, chrono::Utc::now()).await {
                Ok(()) => metrics::gauge!("umbra_inbox_depth").increment(offline_members.len() as f64),
                Err(e) => tracing::error!(error = %e, "group offline fan-in failed"),
            }
            for member_id in &offline_members {
                self.publish_notification(*member_id, message_id).await;
                self.jobs.enqueue(Job::PendingDelivery { user_id: *member_id, message_id });
            }
        }

        let status = Envelope {
            frame_type: "status_update".to_owned(),
            message_id: Some(message_id),
            sender_id: None,
            device_id: None,
            server_id: None,
            timestamp: Some(frame::now_iso()),
            payload: frame::raw_payload(&StatusUpdatePayload {
                status: "sent".to_owned(),
                message_id: Some(message_id),
                delivered_to: Some(delivered_to),
                pending: Some(pending),
            }),
            signature: None,
            nonce: None,
            relay_targets: None,        };
        deliver_local(&hub.local_devices(sender_id), &status);
    }

    // ------------------------------------------------------------------
    // acks / receipts
    // ------------------------------------------------------------------

    async fn handle_delivery_ack(&self, user_id: Uuid, envelope: &Envelope) -> Result<(), String> {
        let payload: DeliveryAckPayload = envelope.parse_payload().map_err(|_| "malformed delivery_ack payload".to_owned())?;
        if let Err(e) = messages::update_message_status(&self.db.pg, payload.message_id, MessageStatus::Delivered, chrono::Utc::now()).await {
            tracing::error!(error = %e, "update_message_status(delivered) failed");
        }
        if let Err(e) = inbox::remove(&self.db.pg, user_id, &[payload.message_id]).await {
            tracing::warn!(error = %e, "inbox remove after delivery_ack failed");
        }
        Ok(())
    }

    async fn handle_read_receipt(&self, _user_id: Uuid, envelope: &Envelope) -> Result<(), String> {
        let payload: ReadReceiptPayload = envelope.parse_payload().map_err(|_| "malformed read_receipt payload".to_owned())?;
        for message_id in payload.message_ids {
            if let Err(e) = messages::update_message_status(&self.db.pg, message_id, MessageStatus::Read, chrono::Utc::now()).await {
                tracing::error!(error = %e, message_id = %message_id, "update_message_status(read) failed");
            }
        }
        Ok(())
    }

    async fn handle_typing(&self, user_id: Uuid, envelope: &Envelope, hub: &HubView<'_>) -> Result<(), String> {
        let payload: TypingPayload = envelope.parse_payload().map_err(|_| "malformed typing payload".to_owned())?;
        let relayed = Envelope {
            sender_id: Some(user_id),
            ..envelope.clone()
        };
        if let Some(receiver_id) = payload.receiver_id {
            self.route_ephemeral(receiver_id, &relayed, hub).await;
        } else if let Some(group_id) = payload.group_id {
            for member_id in groups::member_ids_excluding(&self.db.pg, group_id, user_id).await.unwrap_or_default() {
                self.route_ephemeral(member_id, &relayed, hub).await;
            }
        }
        Ok(())
    }

    /// Best-effort relay for frames that have no offline storage
    /// (typing, signalling): local if connected, else via the owning
    /// node's channel, else dropped.
    async fn route_ephemeral(&self, user_id: Uuid, envelope: &Envelope, hub: &HubView<'_>) {
        let local = hub.local_devices(user_id);
        if !local.is_empty() {
            deliver_local(&local, envelope);
            return;
        }
        if let Some(mut conn) = self.db.redis.clone() {
            if let Ok(routes) = umbra_db::presence::connection_routes(&mut conn, user_id).await {
                self.publish_to_nodes(&routes, user_id, envelope).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // signalling relays (§4.9)
    // ------------------------------------------------------------------

    async fn handle_call(&self, user_id: Uuid, _device_id: Uuid, envelope: &Envelope, hub: &HubView<'_>) -> Result<(), String> {
        let payload: CallPayload = envelope.parse_payload().map_err(|_| "malformed call payload".to_owned())?;
        let Some(target_id) = payload.target() else {
            return Err("call frame missing target_id".to_owned());
        };

        let local = hub.local_devices(target_id);
        if !local.is_empty() {
            deliver_local(&local, &with_sender(envelope, user_id));
            return Ok(());
        }

        if self.presence.is_online(target_id).await {
            if let Some(mut conn) = self.db.redis.clone() {
                if let Ok(routes) = umbra_db::presence::connection_routes(&mut conn, target_id).await {
                    if !routes.is_empty() {
                        self.publish_to_nodes(&routes, target_id, &with_sender(envelope, user_id)).await;
                        return Ok(());
                    }
                }
            }
        }

        let busy = Envelope {
            frame_type: "call_busy".to_owned(),
            message_id: None,
            sender_id: Some(target_id),
            device_id: None,
            server_id: None,
            timestamp: Some(frame::now_iso()),
            payload: frame::raw_payload(&CallBusyPayload { reason: "offline".to_owned() }),
            signature: None,
            nonce: None,
            relay_targets: None,        };
        deliver_local(&hub.local_devices(user_id), &busy);
        Ok(())
    }

    async fn handle_sync_request(&self, user_id: Uuid, device_id: Uuid, envelope: &Envelope, hub: &HubView<'_>) -> Result<(), String> {
        let Some(primary) = self.auth.primary_device_of(user_id).await else {
            return Ok(()); // drop silently (§4.9)
        };

        let forwarded = Envelope {
            device_id: Some(device_id), // preserve originating device so the primary knows whom to answer
            ..envelope.clone()
        };

        let targets: Vec<_> = hub.local_devices(user_id).into_iter().filter(|c| c.device_id == primary).collect();
        if !targets.is_empty() {
            deliver_local(&targets, &forwarded);
            return Ok(());
        }

        if let Some(mut conn) = self.db.redis.clone() {
            if let Ok(routes) = umbra_db::presence::connection_routes(&mut conn, user_id).await {
                let target_routes: Vec<_> = routes.into_iter().filter(|(d, _)| *d == primary).collect();
                self.publish_to_nodes(&target_routes, user_id, &forwarded).await;
            }
        }
        Ok(())
    }

    async fn handle_sync_targeted(&self, user_id: Uuid, envelope: &Envelope, hub: &HubView<'_>) -> Result<(), String> {
        let payload: SyncTargetPayload = envelope.parse_payload().map_err(|_| "malformed sync payload".to_owned())?;

        let targets: Vec<_> = hub.local_devices(user_id).into_iter().filter(|c| c.device_id == payload.target_device_id).collect();
        if !targets.is_empty() {
            deliver_local(&targets, envelope);
            return Ok(());
        }

        if let Some(mut conn) = self.db.redis.clone() {
            if let Ok(routes) = umbra_db::presence::connection_routes(&mut conn, user_id).await {
                let target_routes: Vec<_> = routes.into_iter().filter(|(d, _)| *d == payload.target_device_id).collect();
                self.publish_to_nodes(&target_routes, user_id, envelope).await;
            }
        }
        Ok(())
    }

    async fn handle_media_key(&self, user_id: Uuid, envelope: &Envelope, hub: &HubView<'_>) -> Result<(), String> {
        let payload: MediaKeyPayload = envelope.parse_payload().map_err(|_| "malformed media_key payload".to_owned())?;
        let relayed = with_sender(envelope, user_id);

        let local = hub.local_devices(payload.recipient_id);
        if !local.is_empty() {
            deliver_local(&local, &relayed);
            return Ok(());
        }

        if self.presence.is_online(payload.recipient_id).await {
            if let Some(mut conn) = self.db.redis.clone() {
                if let Ok(routes) = umbra_db::presence::connection_routes(&mut conn, payload.recipient_id).await {
                    self.publish_to_nodes(&routes, payload.recipient_id, &relayed).await;
                }
            }
        }
        // offline: dropped, no offline storage for media keys (§4.9).
        Ok(())
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Drain pending offline entries into a freshly registered connection
    /// (§4.5, §4.8).
    pub async fn drain_inbox_into(&self, user_id: Uuid, handle: &Arc<ConnHandle>) {
        let pending = match inbox::drain(&self.db.pg, user_id, self.config.inbox_drain_batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, %user_id, "inbox drain failed");
                return;
            }
        };

        let mut delivered_ids = Vec::with_capacity(pending.len());
        for message in &pending {
            let deliver = build_deliver_envelope(message, deliver_payload_from_message(message));
            if let Ok(bytes) = deliver.encode() {
                if handle.try_send(bytes) {
                    delivered_ids.push(message.id);
                }
            }
        }

        if !delivered_ids.is_empty() {
            match inbox::remove(&self.db.pg, user_id, &delivered_ids).await {
                Ok(()) => metrics::gauge!("umbra_inbox_depth").decrement(delivered_ids.len() as f64),
                Err(e) => tracing::warn!(error = %e, "inbox remove after drain failed"),
            }
        }
    }

    pub async fn audit_integrity_failure(&self, user_id: Uuid, device_id: Uuid, frame_type: &str, detail: &str) {
        let _ = audit::record(
            &self.db.pg,
            Some(user_id),
            Some(device_id),
            "integrity_failure",
            json!({ "frame_type": frame_type, "detail": detail }),
        )
        .await;
    }

    fn reply_error(&self, user_id: Uuid, _device_id: Uuid, hub: &HubView<'_>, message: &str) {
        let error = Envelope {
            frame_type: "error".to_owned(),
            message_id: None,
            sender_id: None,
            device_id: None,
            server_id: None,
            timestamp: Some(frame::now_iso()),
            payload: frame::raw_payload(&ErrorPayload { error: message.to_owned() }),
            signature: None,
            nonce: None,
            relay_targets: None,        };
        deliver_local(&hub.local_devices(user_id), &error);
    }
}

fn deliver_local(conns: &[Arc<ConnHandle>], envelope: &Envelope) {
    let Ok(bytes) = envelope.encode() else { return };
    for conn in conns {
        let _ = conn.try_send(bytes.clone());
    }
}

fn with_sender(envelope: &Envelope, sender_id: Uuid) -> Envelope {
    Envelope {
        sender_id: Some(sender_id),
        ..envelope.clone()
    }
}

/// Build the `deliver` frame a recipient sees from a persisted message,
/// carrying `payload` verbatim while stamping server-owned fields (§4.1,
/// §4.6: sealed sender ⇒ zero out `senderId` on the remote publish path).
/// Callers on the direct-online path pass the originating frame's own
/// payload bytes so sealed-sender ciphertext and headers survive
/// byte-for-byte; callers with no live origin frame (group fan-out, inbox
/// drain) pass [`deliver_payload_from_message`] instead.
fn build_deliver_envelope(saved: &umbra_common::models::message::Message, payload: Box<RawValue>) -> Envelope {
    Envelope {
        frame_type: "deliver".to_owned(),
        message_id: Some(saved.id),
        sender_id: if saved.sealed_sender_certificate_id.is_some() { Some(Uuid::nil()) } else { Some(saved.sender_id) },
        device_id: None,
        server_id: None,
        timestamp: Some(saved.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        payload,
        signature: None,
        nonce: None,
        relay_targets: None,    }
}

/// Reconstruct a `send`-shaped payload from a persisted message for
/// deliver paths with no live client frame to reuse bytes from (group
/// fan-out, offline inbox drain). Fields the original sender attached for
/// its own key exchange (`prekey_id`, `identity_key`, ...) aren't
/// persisted and come back empty.
fn deliver_payload_from_message(saved: &umbra_common::models::message::Message) -> Box<RawValue> {
    frame::raw_payload(&SendPayload {
        receiver_id: saved.receiver_id,
        group_id: saved.group_id,
        ciphertext: frame::encode_base64(&saved.ciphertext),
        message_type: saved.message_type,
        prekey_id: None,
        signed_prekey_id: None,
        identity_key: None,
        base_key: None,
        media_id: saved.media_id,
        media_type: saved.media_type.clone(),
        sealed_sender_certificate_id: saved.sealed_sender_certificate_id,
        ephemeral_public_key: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_common::models::message::{Message, MessageKind, MessageStatus};

    fn sample_message(sealed: Option<Uuid>) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Some(Uuid::new_v4()),
            group_id: None,
            ciphertext: b"ct".to_vec(),
            message_type: MessageKind::Whisper,
            media_id: None,
            media_type: None,
            timestamp: chrono::Utc::now(),
            status: MessageStatus::Sent,
            delivered_at: None,
            read_at: None,
            sealed_sender_certificate_id: sealed,
        }
    }

    fn origin_envelope() -> Envelope {
        Envelope {
            frame_type: "send".to_owned(),
            message_id: None,
            sender_id: None,
            device_id: None,
            server_id: None,
            timestamp: Some(frame::now_iso()),
            payload: frame::raw_payload(&json!({ "ciphertext": "Zm9v" })),
            signature: None,
            nonce: None,
            relay_targets: None,
        }
    }

    #[test]
    fn deliver_envelope_carries_real_sender_when_not_sealed() {
        let saved = sample_message(None);
        let deliver = build_deliver_envelope(&saved, origin_envelope().payload.clone());
        assert_eq!(deliver.frame_type, "deliver");
        assert_eq!(deliver.sender_id, Some(saved.sender_id));
        assert_eq!(deliver.message_id, Some(saved.id));
    }

    #[test]
    fn deliver_envelope_zeroes_sender_when_sealed() {
        let saved = sample_message(Some(Uuid::new_v4()));
        let deliver = build_deliver_envelope(&saved, origin_envelope().payload.clone());
        assert_eq!(deliver.sender_id, Some(Uuid::nil()));
        assert_ne!(deliver.sender_id, Some(saved.sender_id));
    }

    #[test]
    fn deliver_envelope_reuses_origin_payload_bytes_verbatim() {
        let saved = sample_message(None);
        let origin = origin_envelope();
        let deliver = build_deliver_envelope(&saved, origin.payload.clone());
        assert_eq!(deliver.payload_json(), origin.payload_json());
    }

    #[test]
    fn deliver_envelope_from_message_reconstructs_ciphertext_and_type() {
        let saved = sample_message(None);
        let deliver = build_deliver_envelope(&saved, deliver_payload_from_message(&saved));
        let payload: SendPayload = deliver.parse_payload().unwrap();
        assert_eq!(payload.ciphertext, frame::encode_base64(&saved.ciphertext));
        assert_eq!(payload.message_type, saved.message_type);
        assert_eq!(payload.receiver_id, saved.receiver_id);
    }

    #[test]
    fn with_sender_overwrites_but_preserves_rest() {
        let origin = origin_envelope();
        let user_id = Uuid::new_v4();
        let stamped = with_sender(&origin, user_id);
        assert_eq!(stamped.sender_id, Some(user_id));
        assert_eq!(stamped.frame_type, origin.frame_type);
        assert_eq!(stamped.payload_json(), origin.payload_json());
    }
}
