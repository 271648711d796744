//! Broker subscription and fan-out to viewers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use pubsub::{Broker, Subscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::registry::ClientRegistry;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub channel: String,
    /// Per-client budget for one message.
    pub send_timeout: Duration,
    /// Wait before resubscribing after the subscription fails or ends.
    pub subscribe_retry: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            channel: "attack-map-production".to_string(),
            send_timeout: Duration::from_millis(2000),
            subscribe_retry: Duration::from_secs(5),
        }
    }
}

/// Subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribing,
    Subscribed,
}

/// Result of fanning one message out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    /// Clients removed because their send failed.
    pub evicted: usize,
}

pub struct Broadcaster {
    broker: Arc<dyn Broker>,
    registry: Arc<ClientRegistry>,
    config: BroadcasterConfig,
}

impl Broadcaster {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<ClientRegistry>,
        config: BroadcasterConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            config,
        }
    }

    /// Subscribe and relay until `token` is cancelled, resubscribing after
    /// failures. Messages published while unsubscribed are not replayed.
    pub async fn run(self, token: CancellationToken) {
        let mut state = SubscriptionState::Subscribing;
        let mut subscription: Option<Subscription> = None;

        loop {
            match state {
                SubscriptionState::Subscribing => {
                    let subscribed = tokio::select! {
                        _ = token.cancelled() => break,
                        r = self.broker.subscribe(&self.config.channel) => r,
                    };
                    match subscribed {
                        Ok(sub) => {
                            info!(
                                broker = self.broker.name(),
                                channel = %self.config.channel,
                                "Subscribed to broker channel"
                            );
                            subscription = Some(sub);
                            state = SubscriptionState::Subscribed;
                        }
                        Err(e) => {
                            warn!(
                                channel = %self.config.channel,
                                error = %e,
                                retry_secs = self.config.subscribe_retry.as_secs(),
                                "Broker subscription failed"
                            );
                            if !self.wait_retry(&token).await {
                                break;
                            }
                        }
                    }
                }

                SubscriptionState::Subscribed => {
                    let Some(mut sub) = subscription.take() else {
                        state = SubscriptionState::Subscribing;
                        continue;
                    };
                    loop {
                        let next = tokio::select! {
                            _ = token.cancelled() => return self.stopped(),
                            next = sub.next() => next,
                        };
                        match next {
                            Some(Ok(message)) => {
                                // Invalid payloads are logged inside.
                                let _ = self.broadcast(&message).await;
                            }
                            Some(Err(e)) => warn!(error = %e, "Dropping unreadable broker message"),
                            None => break,
                        }
                    }
                    warn!(
                        channel = %self.config.channel,
                        retry_secs = self.config.subscribe_retry.as_secs(),
                        "Broker subscription lost"
                    );
                    state = SubscriptionState::Subscribing;
                    if !self.wait_retry(&token).await {
                        break;
                    }
                }
            }
        }

        self.stopped()
    }

    fn stopped(&self) {
        info!(channel = %self.config.channel, "Broadcaster stopped");
    }

    async fn wait_retry(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.config.subscribe_retry) => true,
        }
    }

    /// Send one message to every client registered right now.
    ///
    /// Sends run concurrently; a client that fails or exceeds the send
    /// timeout is removed and closed without affecting the rest. Returns
    /// once every send has finished.
    pub async fn broadcast(&self, message: &str) -> Result<BroadcastReport> {
        if let Err(e) = serde_json::from_str::<serde::de::IgnoredAny>(message) {
            warn!(error = %e, "Dropping malformed broker message");
            return Err(Error::malformed(e.to_string()));
        }

        let clients = self.registry.snapshot();
        if clients.is_empty() {
            warn!("Alert received with no connected viewers");
            return Ok(BroadcastReport::default());
        }

        let timeout = self.config.send_timeout;
        let results = join_all(
            clients
                .iter()
                .map(|client| client.send(message.to_string(), timeout)),
        )
        .await;

        let mut report = BroadcastReport {
            recipients: clients.len(),
            ..Default::default()
        };
        for (client, result) in clients.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(client_id = %client.id(), error = %e, "Evicting viewer");
                    self.registry.remove(&client.id());
                    client.close();
                    report.evicted += 1;
                }
            }
        }

        if report.evicted > 0 {
            debug!(?report, "Broadcast finished with evictions");
        } else {
            trace!(recipients = report.recipients, "Broadcast delivered");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::client::{ClientHandle, ClientState};
    use pubsub::LocalBroker;
    use tokio::sync::mpsc;

    fn open_client(capacity: usize) -> (Arc<ClientHandle>, mpsc::Receiver<String>) {
        let (handle, rx) = ClientHandle::new(None, capacity, CancellationToken::new());
        handle.transition(ClientState::Open);
        (handle, rx)
    }

    fn broadcaster(registry: Arc<ClientRegistry>) -> Broadcaster {
        Broadcaster::new(
            Arc::new(LocalBroker::new()),
            registry,
            BroadcasterConfig {
                channel: "alerts".into(),
                send_timeout: Duration::from_millis(100),
                subscribe_retry: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn test_invalid_json_is_dropped() {
        let registry = Arc::new(ClientRegistry::new());
        let (client, mut rx) = open_client(4);
        registry.add(client);
        let err = broadcaster(registry.clone()).broadcast("{not json").await.unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_no_viewers() {
        let registry = Arc::new(ClientRegistry::new());
        let report = broadcaster(registry).broadcast("{}").await.unwrap();
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_client_is_isolated() {
        let registry = Arc::new(ClientRegistry::new());
        let (healthy, mut healthy_rx) = open_client(8);
        // Capacity 1 and never drained.
        let (hung, _hung_rx) = open_client(1);
        registry.add(healthy.clone());
        registry.add(hung.clone());
        let broadcaster = broadcaster(registry.clone());

        let first = broadcaster.broadcast(r#"{"n":1}"#).await.unwrap();
        assert_eq!(first.delivered, 2);

        let started = tokio::time::Instant::now();
        let second = broadcaster.broadcast(r#"{"n":2}"#).await.unwrap();
        assert!(started.elapsed() <= Duration::from_millis(100));
        assert_eq!(second.delivered, 1);
        assert_eq!(second.evicted, 1);

        assert_eq!(healthy_rx.recv().await.unwrap(), r#"{"n":1}"#);
        assert_eq!(healthy_rx.recv().await.unwrap(), r#"{"n":2}"#);
        assert!(!registry.contains(&hung.id()));
        assert!(hung.close_requested());
        assert!(registry.contains(&healthy.id()));
    }

    #[tokio::test]
    async fn test_closed_client_is_evicted() {
        let registry = Arc::new(ClientRegistry::new());
        let (gone, rx) = open_client(4);
        drop(rx);
        registry.add(gone.clone());
        let report = broadcaster(registry.clone()).broadcast("[1,2]").await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_run_relays_and_stops() {
        let broker = Arc::new(LocalBroker::new());
        let registry = Arc::new(ClientRegistry::new());
        let (client, mut rx) = open_client(4);
        registry.add(client);

        let token = CancellationToken::new();
        let task = tokio::spawn(
            Broadcaster::new(broker.clone(), registry, BroadcasterConfig {
                channel: "alerts".into(),
                ..Default::default()
            })
            .run(token.clone()),
        );

        // Wait until the broadcaster has subscribed.
        while broker.subscriber_count("alerts") == 0 {
            tokio::task::yield_now().await;
        }
        broker.publish("alerts", r#"{"type":"Traffic"}"#).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"Traffic"}"#);

        token.cancel();
        task.await.unwrap();
    }
}
