//! Redis pub/sub backend.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Subscription};
use crate::error::{BrokerError, Result};

/// Broker backed by a Redis server's PUBLISH/SUBSCRIBE commands.
///
/// The publishing connection is opened lazily and dropped after any error, so
/// the next publish reconnects. Every subscription owns its own connection.
pub struct RedisBroker {
    client: redis::Client,
    publish_conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBroker {
    /// Create a broker for `url` (e.g. `redis://map_redis:6379`).
    ///
    /// Only the URL is validated here; no connection is made until first use.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            publish_conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.publish_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis for publishing");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        self.publish_conn.lock().await.take();
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.connection().await?;
        let published: redis::RedisResult<i64> = conn.publish(channel, payload).await;
        match published {
            Ok(receivers) => Ok(receivers.max(0) as usize),
            Err(e) => {
                warn!(channel = %channel, error = %e, "Redis publish failed, dropping connection");
                self.reset_connection().await;
                Err(e.into())
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Redis subscription opened");

        let stream = pubsub.into_on_message().map(|msg| {
            msg.get_payload::<String>()
                .map_err(|e| BrokerError::payload(format!("non-text payload: {e}")))
        });

        Ok(stream.boxed())
    }
}
