//! # umbra-gateway
//!
//! The WebSocket routing core: connection admission, the hub actor,
//! routing/fan-out, presence propagation, and the HMAC/nonce integrity
//! layer (§4). This crate owns the `/health`, `/metrics`, and `/ws`
//! HTTP surface (§6); `umbra-server` only wires it to a listener.

pub mod connection;
pub mod frame;
pub mod hub;
pub mod jobs;
pub mod nonce;
pub mod presence;
pub mod rate_limit;
pub mod router;
pub mod verifier;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{mpsc, oneshot};
use umbra_common::auth::{AuthError, Authenticator, SessionClaim};
use umbra_common::config::AppConfig;
use umbra_common::error::UmbraError;
use umbra_db::Database;

use connection::{ConnHandle, ConnectionLimits};
use hub::{HubCommand, HubMetrics, RegisterOutcome};

/// Shared state backing the admission surface. One instance per node,
/// handed to `axum` as the router state.
pub struct GatewayState {
    pub hub_tx: mpsc::Sender<HubCommand>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: Arc<AppConfig>,
    pub db: Arc<Database>,
    pub hub_metrics: HubMetrics,
    pub metrics_handle: PrometheusHandle,
    /// Flipped by the server binary at the start of graceful shutdown
    /// (§7 `ShutdownInProgress`) — new upgrades are refused with 503
    /// while connections already admitted are drained by the hub.
    pub shutting_down: AtomicBool,
}

/// Build the WebSocket admission router, served on `listen_addr` (§6).
pub fn build_ws_router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

/// Build the `/health` + `/metrics` router, served on `health_addr` (§6, §13)
/// — kept off the public WS port so probes and scrapers don't compete with
/// connection admission for the same listener.
pub fn build_health_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Response {
    if state.shutting_down.load(Ordering::Relaxed) {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if state.hub_tx.is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "hub loop stopped").into_response();
    }

    let check = tokio::time::timeout(std::time::Duration::from_secs(1), state.db.health_check()).await;
    match check {
        Ok(true) => (StatusCode::OK, "OK").into_response(),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "database unreachable").into_response(),
    }
}

async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    (StatusCode::OK, state.metrics_handle.render()).into_response()
}

async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutting_down.load(Ordering::Relaxed) {
        return UmbraError::ShutdownInProgress.into_response();
    }

    let Some(token) = extract_token(&params, &headers) else {
        return UmbraError::Unauthenticated.into_response();
    };

    let claim = match state.authenticator.resolve(&token).await {
        Ok(claim) => claim,
        Err(e) => return map_auth_error(e).into_response(),
    };

    let limits = ConnectionLimits::from_config(&state.config);
    let hub_tx = state.hub_tx.clone();

    ws.on_upgrade(move |socket| admit(socket, claim, limits, hub_tx))
}

/// Spawn the connection's reader/writer pair, then register it with the
/// hub before treating it as live — a connection whose registration is
/// rejected (caps exceeded, §3.2 invariant 4) is shut back down
/// immediately rather than ever reaching dispatch.
async fn admit(
    socket: axum::extract::ws::WebSocket,
    claim: SessionClaim,
    limits: ConnectionLimits,
    hub_tx: mpsc::Sender<HubCommand>,
) {
    let handle: Arc<ConnHandle> = connection::spawn(socket, claim.clone(), limits, hub_tx.clone());

    let (reply_tx, reply_rx) = oneshot::channel();
    let registered = hub_tx
        .send(HubCommand::Register { claim, handle: handle.clone(), reply: reply_tx })
        .await
        .is_ok();

    let outcome = if registered { reply_rx.await.ok() } else { None };

    if !matches!(outcome, Some(RegisterOutcome::Accepted)) {
        handle.shut_down().await;
    }
}

fn extract_token(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params.get("token") {
        if !token.is_empty() {
            return Some(token.clone());
        }
    }

    let raw = headers.get(header::SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let mut parts = raw.split(',').map(str::trim);
    let scheme = parts.next()?;
    let token = parts.next()?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token.to_owned())
    } else {
        None
    }
}

fn map_auth_error(e: AuthError) -> UmbraError {
    match e {
        AuthError::NotFound => UmbraError::Unauthenticated,
        AuthError::Expired => UmbraError::TokenExpired,
        AuthError::Revoked => UmbraError::TokenRevoked,
        AuthError::InactiveDevice => UmbraError::UnknownDevice,
    }
}
