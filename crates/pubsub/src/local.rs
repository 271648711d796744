//! In-process broker backed by tokio broadcast channels.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::broker::{Broker, Subscription};
use crate::error::Result;

/// Default per-channel buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broker living inside the current process.
///
/// Used when ingestion and relay run in the same binary, and in tests. A
/// subscriber that falls behind by more than the channel capacity skips the
/// messages it missed.
pub struct LocalBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for LocalBroker {
    fn name(&self) -> &str {
        "local"
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        // No subscribers is not an error for a pub/sub topic.
        Ok(self.sender(channel).send(payload.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        debug!(channel = %channel, "Local subscription opened");

        let stream = futures::stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((Ok(payload), rx)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(channel = %channel, skipped = n, "Local subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broker = LocalBroker::new();
        let delivered = broker.publish("alerts", "{}").await.unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let broker = LocalBroker::new();
        let mut sub = broker.subscribe("alerts").await.unwrap();

        assert_eq!(broker.publish("alerts", "one").await.unwrap(), 1);
        broker.publish("alerts", "two").await.unwrap();

        assert_eq!(sub.next().await.unwrap().unwrap(), "one");
        assert_eq!(sub.next().await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let broker = LocalBroker::new();
        let mut a = broker.subscribe("a").await.unwrap();
        let _b = broker.subscribe("b").await.unwrap();

        broker.publish("b", "for-b").await.unwrap();
        broker.publish("a", "for-a").await.unwrap();

        assert_eq!(a.next().await.unwrap().unwrap(), "for-a");
        assert_eq!(broker.subscriber_count("a"), 1);
        assert_eq!(broker.subscriber_count("b"), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_no_replay() {
        let broker = LocalBroker::new();
        broker.publish("alerts", "early").await.unwrap();

        let mut sub = broker.subscribe("alerts").await.unwrap();
        broker.publish("alerts", "late").await.unwrap();

        assert_eq!(sub.next().await.unwrap().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_ahead() {
        let broker = LocalBroker::with_capacity(2);
        let mut sub = broker.subscribe("alerts").await.unwrap();

        for i in 0..5 {
            broker.publish("alerts", &i.to_string()).await.unwrap();
        }

        // Only the last `capacity` messages survive.
        assert_eq!(sub.next().await.unwrap().unwrap(), "3");
        assert_eq!(sub.next().await.unwrap().unwrap(), "4");
    }
}
