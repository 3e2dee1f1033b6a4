//! Pub/sub bus (§4.10).
//!
//! Channels are named strings (`node:{nodeId}`, `user:{userId}`,
//! `device:{deviceId}`, `presence`, `notifications:{userId}`) carrying the
//! JSON envelope bytes produced by the frame codec. [`RedisBus`] backs a
//! multi-node deployment; [`LocalBus`] is an in-process broadcast used for
//! single-node deployments (no `redis.url` configured) and for the
//! integration tests in `umbra-gateway`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

/// A subscription handle. Each call to [`Bus::subscribe`] returns a fresh
/// receiver backed by an internal forwarding task so callers don't need to
/// care whether the underlying transport is Redis pub/sub or a local
/// broadcast channel.
pub struct BusReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl BusReceiver {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> anyhow::Result<()>;
    async fn subscribe(&self, channel: &str) -> anyhow::Result<BusReceiver>;
}

/// Redis-backed bus for multi-node clusters.
pub struct RedisBus {
    client: redis::Client,
    publish_conn: redis::aio::ConnectionManager,
}

impl RedisBus {
    pub fn new(client: redis::Client, publish_conn: redis::aio::ConnectionManager) -> Self {
        Self { client, publish_conn }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> anyhow::Result<()> {
        let started = std::time::Instant::now();
        let mut conn = self.publish_conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        metrics::histogram!("umbra_bus_publish_latency_seconds").record(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<BusReceiver> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(256);
        let channel_name = channel.to_owned();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                use futures_util::StreamExt;
                match stream.next().await {
                    Some(msg) => {
                        let payload: Vec<u8> = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!(error = %e, channel = %channel_name, "malformed bus payload");
                                continue;
                            }
                        };
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });

        Ok(BusReceiver { rx })
    }
}

/// In-process bus for single-node deployments and tests. One
/// `broadcast::Sender` per channel name, created lazily.
#[derive(Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().expect("local bus mutex poisoned");
        channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> anyhow::Result<()> {
        let started = std::time::Instant::now();
        // No subscribers on a channel is not an error — it just means no
        // other local connections (or any, in single-node mode) care yet.
        let _ = self.sender_for(channel).send(payload.to_vec());
        metrics::histogram!("umbra_bus_publish_latency_seconds").record(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<BusReceiver> {
        let mut broadcast_rx = self.sender_for(channel).subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(BusReceiver { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_delivers_to_subscriber() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("user:123").await.unwrap();
        bus.publish("user:123", b"hello").await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn local_bus_channels_are_isolated() {
        let bus = LocalBus::new();
        let mut rx_a = bus.subscribe("a").await.unwrap();
        bus.publish("b", b"nope").await.unwrap();
        bus.publish("a", b"yes").await.unwrap();
        let got = rx_a.recv().await.unwrap();
        assert_eq!(got, b"yes");
    }
}
