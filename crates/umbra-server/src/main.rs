//! # Umbra Server
//!
//! The node binary: connects to Postgres/Redis, wires up the hub, router,
//! and presence policy (§4), and serves the WebSocket admission surface
//! plus `/health` and `/metrics` (§6). One process is one cluster node,
//! identified by `config.server_id`.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use umbra_db::bus::{Bus, LocalBus, RedisBus};
use umbra_db::sessions::PgAuthenticator;
use umbra_db::Database;
use umbra_gateway::hub::Hub;
use umbra_gateway::jobs::InProcessJobQueue;
use umbra_gateway::presence::PresencePolicy;
use umbra_gateway::router::Router;
use umbra_gateway::GatewayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = umbra_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "umbra=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!(server_id = %config.server_id, "starting umbra node v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    let db = Arc::new(Database::connect(config).await?);
    db.migrate().await?;

    let config: Arc<umbra_common::config::AppConfig> = Arc::new(config.clone());

    let bus: Arc<dyn Bus> = if config.redis.url.is_empty() {
        tracing::info!("running single-node: in-process bus, no cross-node presence/routing");
        Arc::new(LocalBus::new())
    } else {
        let client = redis::Client::open(config.redis.url.as_str())?;
        let publish_conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Arc::new(RedisBus::new(client, publish_conn))
    };

    let authenticator = Arc::new(PgAuthenticator::new(db.pg.clone()));
    let presence = Arc::new(PresencePolicy::new(
        db.clone(),
        bus.clone(),
        config.server_id.clone(),
        config.presence_ttl_secs,
        config.online_ttl_secs,
    ));
    let jobs = Arc::new(InProcessJobQueue::spawn(db.clone()));
    let router = Arc::new(Router::new(db.clone(), bus.clone(), presence.clone(), authenticator.clone(), config.clone(), jobs));

    let (hub, hub_tx, hub_metrics) = Hub::new(config.clone(), router, presence);
    umbra_gateway::hub::spawn_bus_relay(bus.clone(), config.server_id.clone(), hub_tx.clone());
    let hub_task = tokio::spawn(hub.run());

    let state = Arc::new(GatewayState {
        hub_tx: hub_tx.clone(),
        authenticator,
        config: config.clone(),
        db: db.clone(),
        hub_metrics,
        metrics_handle,
        shutting_down: std::sync::atomic::AtomicBool::new(false),
    });

    let ws_router = umbra_gateway::build_ws_router(state.clone());
    let health_router = umbra_gateway::build_health_router(state.clone());

    let ws_addr: SocketAddr = config.listen_addr.parse()?;
    let health_addr: SocketAddr = config.health_addr.parse()?;

    tracing::info!("websocket admission listening on ws://{ws_addr}/ws");
    tracing::info!("health/metrics listening on http://{health_addr}");

    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await?;
    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;

    let result = tokio::try_join!(
        async {
            axum::serve(ws_listener, ws_router.into_make_service())
                .with_graceful_shutdown(shutdown_signal(state.clone()))
                .await?;
            Ok::<_, anyhow::Error>(())
        },
        async {
            axum::serve(health_listener, health_router.into_make_service())
                .with_graceful_shutdown(shutdown_signal(state.clone()))
                .await?;
            Ok::<_, anyhow::Error>(())
        },
    );

    if let Err(e) = result {
        tracing::error!(error = %e, "server task failed");
    }

    let _ = hub_tx.send(umbra_gateway::hub::HubCommand::Shutdown).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), hub_task).await;

    Ok(())
}

/// Resolves once an interrupt or terminate signal arrives, flipping
/// [`GatewayState::shutting_down`] first so new upgrades get 503 while
/// connections already admitted finish draining (§7 `ShutdownInProgress`).
async fn shutdown_signal(state: Arc<GatewayState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining connections");
    state.shutting_down.store(true, Ordering::Relaxed);
}
