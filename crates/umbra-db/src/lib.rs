//! # umbra-db
//!
//! Persistence layer for the routing core: PostgreSQL for everything that
//! must survive a node restart (messages, devices, prekeys, the offline
//! inbox, sessions, audit events), Redis for TTL'd presence state and the
//! cross-node pub/sub bus.
//!
//! Redis is optional. Without a `redis.url`, the node runs single-node:
//! presence falls back to an in-process map and the bus falls back to
//! [`bus::LocalBus`] — the same "lite mode" shape the rest of the stack
//! uses for tests and single-node deployments.

pub mod bus;
pub mod postgres;
pub mod presence;
pub mod redis_pool;
pub mod repository;
pub mod sessions;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use umbra_common::config::AppConfig;

/// Shared database handle passed through the gateway and server crates.
#[derive(Clone)]
pub struct Database {
    pub pg: PgPool,
    /// `None` when `redis.url` is unset — the node then runs single-node
    /// (no cross-node presence/bus, see [`presence`] and [`bus`]).
    pub redis: Option<redis::aio::ConnectionManager>,
}

impl Database {
    /// Connect to Postgres (required) and Redis (optional).
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        tracing::info!("connecting to PostgreSQL");
        let pg = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .connect(&config.database.url)
            .await
            .context("failed to connect to PostgreSQL")?;

        let redis = if config.redis.url.is_empty() {
            tracing::info!("redis.url unset — running single-node (no cross-node presence/bus)");
            None
        } else {
            tracing::info!("connecting to Redis");
            let client = redis::Client::open(config.redis.url.as_str())
                .context("invalid redis.url")?;
            let mgr = redis::aio::ConnectionManager::new(client)
                .await
                .context("failed to connect to Redis")?;
            Some(mgr)
        };

        Ok(Self { pg, redis })
    }

    /// Run migrations. Call once at startup before serving traffic.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("running database migrations");
        sqlx::migrate!("./migrations").run(&self.pg).await?;
        tracing::info!("migrations complete");
        Ok(())
    }

    /// `GET /health` backing check — used to decide whether the node
    /// should accept new connections (§6).
    pub async fn health_check(&self) -> bool {
        postgres::health_check(&self.pg).await
    }
}
