//! Connection (§3.1 `Connection`, §4.4).
//!
//! Each connection owns two cooperating tasks joined by a bounded
//! outbound queue: the reader applies the rate limiter and forwards
//! decoded frames to the hub; the writer drains the queue opportunistically
//! and pings on a timer. Both tasks exit when the socket closes or the hub
//! schedules a shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::interval;
use umbra_common::auth::SessionClaim;
use umbra_common::config::AppConfig;
use uuid::Uuid;

use crate::frame::{Envelope, FrameError, MAX_FRAME_BYTES};
use crate::hub::HubCommand;
use crate::rate_limit::TokenBucket;

/// A handle the hub holds for each registered connection — everything it
/// needs to reach the connection without touching its internals.
pub struct ConnHandle {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub hmac_key: [u8; 32],
    outbound: mpsc::Sender<Vec<u8>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl ConnHandle {
    /// Non-blocking enqueue. Returns `false` if the queue is full — the
    /// caller (hub/router) must then treat the connection as stuck and
    /// schedule an unregister (§4.4, §5 back-pressure policy).
    pub fn try_send(&self, frame: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.outbound.try_send(frame).is_ok()
    }

    pub async fn shut_down(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

pub struct ConnectionLimits {
    pub send_queue_size: usize,
    pub back_pressure_threshold: usize,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
}

impl ConnectionLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            send_queue_size: config.send_queue_size,
            back_pressure_threshold: config.back_pressure_threshold,
            pong_wait: Duration::from_secs(config.pong_wait_secs),
            ping_period: Duration::from_secs(config.ping_period_secs),
            write_wait: Duration::from_secs(config.write_wait_secs),
            rate_limit_per_sec: config.rate_limit_per_sec,
            rate_limit_burst: config.rate_limit_burst,
        }
    }
}

/// Spawn the reader/writer pair for a freshly-admitted connection. Returns
/// the handle the hub should register.
pub fn spawn(
    socket: WebSocket,
    claim: SessionClaim,
    limits: ConnectionLimits,
    hub_tx: mpsc::Sender<HubCommand>,
) -> Arc<ConnHandle> {
    let conn_id = Uuid::new_v4();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(limits.send_queue_size);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let handle = Arc::new(ConnHandle {
        conn_id,
        user_id: claim.user_id,
        device_id: claim.device_id,
        hmac_key: claim.hmac_key,
        outbound: outbound_tx,
        shutdown: Mutex::new(Some(shutdown_tx)),
        closed: AtomicBool::new(false),
    });

    let (ws_sink, ws_stream) = socket.split();

    let span = tracing::info_span!("conn", user_id = %claim.user_id, device_id = %claim.device_id, %conn_id);

    tokio::spawn({
        let span = span.clone();
        async move { run_writer(ws_sink, outbound_rx, shutdown_rx, limits.ping_period, limits.write_wait, limits.back_pressure_threshold).await }
            .instrument(span)
    });

    tokio::spawn({
        let span = span.clone();
        let hub_tx = hub_tx.clone();
        let handle = handle.clone();
        async move { run_reader(ws_stream, claim, handle, hub_tx, limits.pong_wait, limits.rate_limit_per_sec, limits.rate_limit_burst).await }
            .instrument(span)
    });

    handle
}

use tracing::Instrument;

async fn run_reader(
    mut ws_stream: futures_util::stream::SplitStream<WebSocket>,
    claim: SessionClaim,
    handle: Arc<ConnHandle>,
    hub_tx: mpsc::Sender<HubCommand>,
    pong_wait: Duration,
    rate_limit_per_sec: u32,
    rate_limit_burst: u32,
) {
    let mut bucket = TokenBucket::new(rate_limit_per_sec, rate_limit_burst);

    loop {
        let next = tokio::time::timeout(pong_wait, ws_stream.next()).await;
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!(error = %e, "websocket read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!("pong wait elapsed, closing connection");
                break;
            }
        };

        let bytes = match msg {
            WsMessage::Text(text) => text.into_bytes().to_vec(),
            WsMessage::Binary(bin) => bin.to_vec(),
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };

        if bytes.len() > MAX_FRAME_BYTES {
            tracing::warn!("frame exceeds max size, closing connection");
            break;
        }

        if !bucket.try_acquire(Instant::now()) {
            let _ = hub_tx
                .send(HubCommand::RateLimited { conn_id: handle.conn_id })
                .await;
            continue;
        }

        // A writer batch may have concatenated multiple frames with `\n`
        // (§4.4); a reader symmetrically accepts multi-line payloads.
        for line in bytes.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            match Envelope::decode(line) {
                Ok(envelope) => {
                    let cmd = HubCommand::InboundFrame {
                        conn_id: handle.conn_id,
                        user_id: claim.user_id,
                        device_id: claim.device_id,
                        envelope,
                    };
                    if hub_tx.send(cmd).await.is_err() {
                        return;
                    }
                }
                Err(FrameError::TooLarge { .. }) => {
                    tracing::warn!("oversize frame in batch, closing connection");
                    let _ = hub_tx
                        .send(HubCommand::Unregister { user_id: claim.user_id, device_id: claim.device_id })
                        .await;
                    return;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "dropping malformed frame");
                }
            }
        }
    }

    let _ = hub_tx
        .send(HubCommand::Unregister { user_id: claim.user_id, device_id: claim.device_id })
        .await;
}

async fn run_writer(
    mut ws_sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ping_period: Duration,
    write_wait: Duration,
    back_pressure_threshold: usize,
) {
    let mut ping_timer = interval(ping_period);
    ping_timer.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if tokio::time::timeout(write_wait, ws_sink.send(WsMessage::Ping(Vec::new().into()))).await.is_err() {
                    break;
                }
            }
            _ = &mut shutdown_rx => break,
            first = outbound_rx.recv() => {
                let Some(first) = first else { break };

                let mut batch = vec![first];
                while let Ok(next) = outbound_rx.try_recv() {
                    batch.push(next);
                }

                if outbound_rx.len() > back_pressure_threshold {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }

                let combined = batch.join(&b'\n');
                let send = ws_sink.send(WsMessage::Text(String::from_utf8_lossy(&combined).into_owned().into()));
                if tokio::time::timeout(write_wait, send).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = ws_sink.send(WsMessage::Close(None)).await;
}
