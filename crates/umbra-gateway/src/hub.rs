//! Hub — the per-node local dispatcher (§4.5).
//!
//! Single serialised control channel carrying `register` / `unregister` /
//! `inbound-frame` events. All mutations of `clients` and the connection
//! counter happen from this loop; nothing outside it is allowed to touch
//! them directly (§5 shared-resource policy).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use umbra_common::auth::SessionClaim;
use umbra_common::config::AppConfig;
use umbra_db::bus::Bus;
use uuid::Uuid;

use crate::connection::ConnHandle;
use crate::frame::{self, Envelope, ErrorPayload};
use crate::nonce::NonceStore;
use crate::presence::{self, PresenceBroadcast, PresencePolicy};
use crate::router::Router;
use crate::verifier;

pub enum HubCommand {
    Register {
        claim: SessionClaim,
        handle: Arc<ConnHandle>,
        reply: oneshot::Sender<RegisterOutcome>,
    },
    Unregister {
        user_id: Uuid,
        device_id: Uuid,
    },
    InboundFrame {
        conn_id: Uuid,
        user_id: Uuid,
        device_id: Uuid,
        envelope: Envelope,
    },
    RateLimited {
        conn_id: Uuid,
    },
    /// A frame arriving over the bus from another node — already HMAC/nonce
    /// verified at its origin, injected straight into dispatch (§4.10).
    RemoteFrame {
        envelope: Envelope,
    },
    PresenceEvent {
        event: PresenceBroadcast,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted,
    /// Caps exceeded (§3.2 invariant 4) — the connection is refused and
    /// closed by the caller.
    Rejected,
}

/// Read-only snapshot handle for metrics and `/health` — total connection
/// count is cheap to read without round-tripping through the hub loop.
#[derive(Clone)]
pub struct HubMetrics {
    pub total_connections: Arc<AtomicUsize>,
}

pub struct Hub {
    clients: HashMap<Uuid, Vec<Arc<ConnHandle>>>,
    by_conn_id: HashMap<Uuid, Arc<ConnHandle>>,
    total_connections: Arc<AtomicUsize>,
    nonce_store: NonceStore,
    config: Arc<AppConfig>,
    router: Arc<Router>,
    presence: Arc<PresencePolicy>,
    rx: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Build a hub plus the sender every connection task will clone. The
    /// hub owns its receiver outright — `run` needs nothing else.
    pub fn new(config: Arc<AppConfig>, router: Arc<Router>, presence: Arc<PresencePolicy>) -> (Self, mpsc::Sender<HubCommand>, HubMetrics) {
        let (tx, rx) = mpsc::channel(config.hub_channel_capacity);
        let total_connections = Arc::new(AtomicUsize::new(0));
        let metrics = HubMetrics { total_connections: total_connections.clone() };
        let nonce_store = NonceStore::new(
            Duration::from_secs(config.nonce_window_secs),
            Duration::from_secs(config.nonce_retain_secs),
        );
        (
            Self {
                clients: HashMap::new(),
                by_conn_id: HashMap::new(),
                total_connections,
                nonce_store,
                config,
                router,
                presence,
                rx,
            },
            tx,
            metrics,
        )
    }

    /// Run the hub loop to completion.
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                HubCommand::Register { claim, handle, reply } => {
                    let outcome = self.register(claim, handle).await;
                    let _ = reply.send(outcome);
                }
                HubCommand::Unregister { user_id, device_id } => {
                    self.unregister(user_id, device_id).await;
                }
                HubCommand::InboundFrame { conn_id, user_id, device_id, envelope } => {
                    self.dispatch(conn_id, user_id, device_id, envelope).await;
                }
                HubCommand::RateLimited { conn_id } => {
                    self.send_error(conn_id, "rate limited");
                }
                HubCommand::RemoteFrame { envelope } => {
                    self.router.handle_remote(envelope, HubView { hub: &self }).await;
                }
                HubCommand::PresenceEvent { event } => {
                    self.apply_presence_event(event).await;
                }
                HubCommand::Shutdown => {
                    self.drain_all().await;
                    break;
                }
            }
        }
    }

    async fn register(&mut self, claim: SessionClaim, handle: Arc<ConnHandle>) -> RegisterOutcome {
        if self.total_connections.load(Ordering::Relaxed) as u32 >= self.config.max_total_connections {
            return RegisterOutcome::Rejected;
        }
        let per_user = self.clients.get(&claim.user_id).map_or(0, Vec::len);
        if per_user as u32 >= self.config.max_connections_per_user {
            return RegisterOutcome::Rejected;
        }

        // Invariant 3 (§3.2): a new connection for the same (user, device)
        // on this node supersedes the prior one.
        if let Some(existing) = self.clients.get_mut(&claim.user_id) {
            if let Some(pos) = existing.iter().position(|h| h.device_id == claim.device_id) {
                let prior = existing.remove(pos);
                self.by_conn_id.remove(&prior.conn_id);
                let total = self.total_connections.fetch_sub(1, Ordering::Relaxed) - 1;
                metrics::gauge!("umbra_total_connections").set(total as f64);
                prior.shut_down().await;
            }
        }

        let was_offline = !self.clients.contains_key(&claim.user_id)
            || self.clients.get(&claim.user_id).is_some_and(Vec::is_empty);

        self.by_conn_id.insert(handle.conn_id, handle.clone());
        self.clients.entry(claim.user_id).or_default().push(handle.clone());
        let total = self.total_connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("umbra_total_connections").set(total as f64);

        if let Some(event) = self
            .presence
            .on_register(claim.user_id, claim.device_id, was_offline)
            .await
        {
            self.deliver_presence_locally(&event).await;
        }

        self.router.drain_inbox_into(claim.user_id, &handle).await;

        RegisterOutcome::Accepted
    }

    async fn unregister(&mut self, user_id: Uuid, device_id: Uuid) {
        let mut became_offline = false;
        if let Some(conns) = self.clients.get_mut(&user_id) {
            if let Some(pos) = conns.iter().position(|h| h.device_id == device_id) {
                let removed = conns.remove(pos);
                self.by_conn_id.remove(&removed.conn_id);
                let total = self.total_connections.fetch_sub(1, Ordering::Relaxed) - 1;
                metrics::gauge!("umbra_total_connections").set(total as f64);
                removed.shut_down().await;
            }
            if conns.is_empty() {
                self.clients.remove(&user_id);
                became_offline = true;
            }
        }

        if let Some(event) = self.presence.on_unregister(user_id, device_id, became_offline).await {
            self.deliver_presence_locally(&event).await;
        }
    }

    async fn dispatch(&mut self, conn_id: Uuid, user_id: Uuid, device_id: Uuid, envelope: Envelope) {
        if matches!(envelope.frame_type.as_str(), "error" | "heartbeat_ack") {
            return; // server-originated only, never accepted inbound
        }

        let Some(hmac_key) = self.by_conn_id.get(&conn_id).map(|h| h.hmac_key) else {
            return; // connection already unregistered, nothing to dispatch to
        };
        if let Err(e) = verifier::verify(&envelope, &hmac_key, chrono::Utc::now()) {
            tracing::warn!(%user_id, %device_id, error = %e, frame_type = %envelope.frame_type, "integrity failure, dropping frame and closing connection");
            metrics::counter!("umbra_hmac_failures_total").increment(1);
            self.router.audit_integrity_failure(user_id, device_id, &envelope.frame_type, &e.to_string()).await;
            self.unregister(user_id, device_id).await;
            return;
        }

        let Some(nonce) = &envelope.nonce else {
            self.unregister(user_id, device_id).await;
            return;
        };
        if !self.nonce_store.check_and_insert(nonce) {
            tracing::warn!(%user_id, %device_id, "replayed nonce, dropping frame and closing connection");
            metrics::counter!("umbra_replay_attempts_total").increment(1);
            self.router.audit_integrity_failure(user_id, device_id, &envelope.frame_type, "replayed nonce").await;
            self.unregister(user_id, device_id).await;
            return;
        }

        if envelope.frame_type == "heartbeat" {
            self.send_to_conn(conn_id, heartbeat_ack());
            self.presence.refresh_heartbeat(user_id, device_id).await;
            return;
        }

        if !frame::is_recognized(&envelope.frame_type) {
            self.send_to_conn(conn_id, error_frame(&format!("unknown frame type: {}", envelope.frame_type)));
            return;
        }

        metrics::counter!("umbra_frames_total", "type" => envelope.frame_type.clone()).increment(1);
        self.router
            .handle(user_id, device_id, envelope, HubView { hub: self })
            .await;
    }

    fn send_to_conn(&self, conn_id: Uuid, envelope: Envelope) {
        if let Some(handle) = self.by_conn_id.get(&conn_id) {
            if let Ok(bytes) = envelope.encode() {
                let _ = handle.try_send(bytes);
            }
        }
    }

    fn send_error(&self, conn_id: Uuid, message: &str) {
        self.send_to_conn(conn_id, error_frame(message));
    }

    /// All local connections for a user (used by the router for direct
    /// fan-out to every device).
    pub(crate) fn local_devices(&self, user_id: Uuid) -> Vec<Arc<ConnHandle>> {
        self.clients.get(&user_id).cloned().unwrap_or_default()
    }

    async fn drain_all(&mut self) {
        for (_, conns) in self.clients.drain() {
            for conn in conns {
                conn.shut_down().await;
            }
        }
        self.by_conn_id.clear();
    }

    /// Apply a presence change received over the `presence` bus channel
    /// (§4.7). Loop avoidance: a node never re-applies its own event via
    /// the bus round trip — it already delivered locally at the origin
    /// (see [`Self::deliver_presence_locally`]).
    async fn apply_presence_event(&self, event: PresenceBroadcast) {
        if event.server_id == *self.presence.server_id() {
            return;
        }
        self.deliver_presence_locally(&event).await;
    }

    /// Contact-set scoping (§4.7): deliver a presence change to this
    /// node's locally-connected contacts of the affected user.
    async fn deliver_presence_locally(&self, event: &PresenceBroadcast) {
        let contacts = self.presence.contacts_of(event.user_id).await;
        let envelope = presence::presence_envelope(event);

        for contact_id in contacts {
            for conn in self.local_devices(contact_id) {
                if let Ok(bytes) = envelope.encode() {
                    let _ = conn.try_send(bytes);
                }
            }
        }
    }
}

/// Subscribe to this node's point-to-point channel and the global
/// `presence` channel, forwarding everything into the hub loop as if it
/// had arrived locally (§4.10: "bypassing HMAC/nonce checks — the bus is
/// a trusted intra-cluster channel").
pub fn spawn_bus_relay(bus: Arc<dyn Bus>, server_id: String, hub_tx: mpsc::Sender<HubCommand>) {
    tokio::spawn({
        let bus = bus.clone();
        let hub_tx = hub_tx.clone();
        async move {
            let Ok(mut rx) = bus.subscribe(&format!("node:{server_id}")).await else {
                tracing::error!("failed to subscribe to node channel, cluster routing disabled");
                return;
            };
            while let Some(payload) = rx.recv().await {
                match serde_json::from_slice::<Envelope>(&payload) {
                    Ok(envelope) => {
                        if hub_tx.send(HubCommand::RemoteFrame { envelope }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed envelope on node channel"),
                }
            }
        }
    });

    tokio::spawn(async move {
        let Ok(mut rx) = bus.subscribe("presence").await else {
            tracing::error!("failed to subscribe to presence channel, cross-node presence disabled");
            return;
        };
        while let Some(payload) = rx.recv().await {
            match serde_json::from_slice::<PresenceBroadcast>(&payload) {
                Ok(event) => {
                    if hub_tx.send(HubCommand::PresenceEvent { event }).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed payload on presence channel"),
            }
        }
    });
}

/// A narrow view the router uses to reach local connections without
/// owning the hub's full private state — keeps `clients`/`total_connections`
/// mutation exclusive to the hub loop (§5).
pub struct HubView<'a> {
    hub: &'a Hub,
}

impl<'a> HubView<'a> {
    pub fn local_devices(&self, user_id: Uuid) -> Vec<Arc<ConnHandle>> {
        self.hub.local_devices(user_id)
    }
}

fn heartbeat_ack() -> Envelope {
    Envelope {
        frame_type: "heartbeat_ack".into(),
        message_id: None,
        sender_id: None,
        device_id: None,
        server_id: None,
        timestamp: Some(frame::now_iso()),
        payload: frame::raw_payload(&serde_json::json!({})),
        signature: None,
        nonce: None,
        relay_targets: None,    }
}

fn error_frame(message: &str) -> Envelope {
    Envelope {
        frame_type: "error".into(),
        message_id: None,
        sender_id: None,
        device_id: None,
        server_id: None,
        timestamp: Some(frame::now_iso()),
        payload: frame::raw_payload(&ErrorPayload { error: message.to_owned() }),
        signature: None,
        nonce: None,
        relay_targets: None,    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_ack_has_no_signature_and_empty_payload() {
        let ack = heartbeat_ack();
        assert_eq!(ack.frame_type, "heartbeat_ack");
        assert!(ack.signature.is_none());
        assert!(ack.nonce.is_none());
        assert_eq!(ack.payload_json(), "{}");
    }

    #[test]
    fn error_frame_carries_the_message() {
        let err = error_frame("rate limited");
        assert_eq!(err.frame_type, "error");
        let payload: ErrorPayload = err.parse_payload().unwrap();
        assert_eq!(payload.error, "rate limited");
    }
}

