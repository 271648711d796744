use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pubsub::Broker;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::EnrichedAlert;
use crate::backoff::{Attempt, BackoffPolicy, RetryError, retry};

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub channel: String,
    /// Budget for one message, retries included. The message is dropped after it.
    pub publish_timeout: Duration,
    /// Messages waiting to be published. Submissions past this are dropped.
    pub queue_capacity: usize,
    pub retry: BackoffPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            channel: "attack-map-production".to_string(),
            publish_timeout: Duration::from_millis(1000),
            queue_capacity: 1024,
            retry: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(400),
                jitter: true,
            },
        }
    }
}

/// Counters exposed for logs and tests.
#[derive(Debug, Default)]
pub struct PublisherStats {
    published: AtomicU64,
    dropped_full: AtomicU64,
    dropped_failed: AtomicU64,
}

impl PublisherStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Rejected because the queue was full.
    pub fn dropped_full(&self) -> u64 {
        self.dropped_full.load(Ordering::Relaxed)
    }

    /// Broker failures and timeouts.
    pub fn dropped_failed(&self) -> u64 {
        self.dropped_failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped_full() + self.dropped_failed()
    }
}

/// Handle for submitting alerts to the single publish queue.
///
/// One queue drained by one task, so alerts leave in submission order.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<String>,
    stats: Arc<PublisherStats>,
}

impl Publisher {
    /// Start the drain task. It stops when `token` is cancelled or every
    /// handle has been dropped.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        config: PublisherConfig,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(PublisherStats::default());
        let task = tokio::spawn(drain(broker, config, rx, stats.clone(), token));
        (Self { tx, stats }, task)
    }

    /// Queue an alert. Never waits; returns `false` if the alert was dropped.
    pub fn submit(&self, alert: &EnrichedAlert) -> bool {
        let payload = match alert.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize alert, dropping");
                self.stats.dropped_failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.stats.dropped_full.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event_count = alert.event_count(),
                    dropped, "Publish queue full, dropping alert"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Publish queue closed, dropping alert");
                self.stats.dropped_failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }
}

async fn drain(
    broker: Arc<dyn Broker>,
    config: PublisherConfig,
    mut rx: mpsc::Receiver<String>,
    stats: Arc<PublisherStats>,
    token: CancellationToken,
) {
    info!(
        broker = broker.name(),
        channel = %config.channel,
        "Publisher started"
    );

    loop {
        let payload = tokio::select! {
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(payload) => payload,
                None => break,
            },
        };

        let attempt = retry(&config.retry, &token, |_| {
            let broker = broker.clone();
            let channel = config.channel.as_str();
            let payload = payload.as_str();
            async move {
                match broker.publish(channel, payload).await {
                    Ok(receivers) => Attempt::Done(receivers),
                    Err(e) if e.is_transient() => Attempt::Retry(e),
                    Err(e) => Attempt::Fail(e),
                }
            }
        });

        match tokio::time::timeout(config.publish_timeout, attempt).await {
            Ok(Ok(receivers)) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
                if receivers == 0 {
                    debug!(channel = %config.channel, "Published with no subscribers");
                }
            }
            Ok(Err(RetryError::Failed(e))) => {
                stats.dropped_failed.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %config.channel, error = %e, "Publish failed, dropping alert");
            }
            Ok(Err(RetryError::Cancelled)) => break,
            Err(_) => {
                stats.dropped_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    channel = %config.channel,
                    timeout_ms = config.publish_timeout.as_millis() as u64,
                    "Publish timed out, dropping alert"
                );
            }
        }
    }

    info!(
        published = stats.published(),
        dropped = stats.dropped(),
        "Publisher stopped"
    );
}
