//! Per-zone ingest worker.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connector::{FrameStream, StreamConnector};
use super::provision::Provisioner;
use crate::alert::decode_frame;
use crate::backoff::BackoffPolicy;
use crate::enrich::Enricher;
use crate::error::{Error, Result};
use crate::publish::Publisher;

/// Reconnect timing for one zone.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive connection failures. Delay doubles per failure.
    pub backoff: BackoffPolicy,
    /// Wait after `backoff.max_retries` is exceeded.
    pub cooldown: Duration,
    /// Wait after a failed provisioning call.
    pub provision_retry: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            cooldown: Duration::from_secs(10),
            provision_retry: Duration::from_secs(5),
        }
    }
}

/// Where a zone worker is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneState {
    Provisioning,
    Connecting { url: String },
    Streaming { url: String },
    Error { reason: String },
    Backoff { delay: Duration },
    CoolDown,
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Provisioning => "provisioning",
            Self::Connecting { .. } => "connecting",
            Self::Streaming { .. } => "streaming",
            Self::Error { .. } => "error",
            Self::Backoff { .. } => "backoff",
            Self::CoolDown => "cooldown",
        })
    }
}

/// Runs one zone's ingest loop. Anything that can be restarted by a
/// supervisor implements this.
pub trait ZoneRunner: Send + Sync + 'static {
    fn run_zone(&self, zone: String, token: CancellationToken) -> BoxFuture<'static, Result<()>>;
}

/// Provision, connect, stream, enrich and publish for a zone, forever.
///
/// Clones share the enricher, publisher and collaborators.
#[derive(Clone)]
pub struct StreamIngestor {
    provisioner: Arc<dyn Provisioner>,
    connector: Arc<dyn StreamConnector>,
    enricher: Enricher,
    publisher: Publisher,
    config: ReconnectConfig,
}

impl StreamIngestor {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        connector: Arc<dyn StreamConnector>,
        enricher: Enricher,
        publisher: Publisher,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            provisioner,
            connector,
            enricher,
            publisher,
            config,
        }
    }

    /// Run until `token` is cancelled. Only returns early on cancellation.
    pub async fn run(self, zone: String, token: CancellationToken) -> Result<()> {
        let mut state = ZoneState::Provisioning;
        let mut failures: u32 = 0;
        let mut active: Option<FrameStream> = None;

        info!(zone = %zone, "Zone worker started");

        loop {
            if token.is_cancelled() {
                break;
            }
            debug!(zone = %zone, state = %state, failures, "Zone state");

            state = match state {
                ZoneState::Provisioning => {
                    let provisioned = tokio::select! {
                        _ = token.cancelled() => break,
                        r = self.provisioner.provision(&zone) => r,
                    };
                    match provisioned {
                        Ok(url) => ZoneState::Connecting { url },
                        Err(e) => {
                            warn!(
                                zone = %zone,
                                error = %e,
                                retry_secs = self.config.provision_retry.as_secs(),
                                "Provisioning failed"
                            );
                            if !sleep_or_cancel(&token, self.config.provision_retry).await {
                                break;
                            }
                            ZoneState::Provisioning
                        }
                    }
                }

                ZoneState::Connecting { url } => {
                    let connected = tokio::select! {
                        _ = token.cancelled() => break,
                        r = self.connector.connect(&url) => r,
                    };
                    match connected {
                        Ok(frames) => {
                            if failures > 0 {
                                info!(zone = %zone, after_failures = failures, "Zone stream reconnected");
                            } else {
                                info!(zone = %zone, "Zone stream connected");
                            }
                            failures = 0;
                            active = Some(frames);
                            ZoneState::Streaming { url }
                        }
                        Err(e) => ZoneState::Error {
                            reason: e.to_string(),
                        },
                    }
                }

                ZoneState::Streaming { .. } => match active.take() {
                    Some(frames) => match self.stream(&zone, frames, &token).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Lost(reason) => ZoneState::Error { reason },
                    },
                    None => ZoneState::Provisioning,
                },

                ZoneState::Error { reason } => {
                    failures += 1;
                    if self.config.backoff.exhausted(failures) {
                        error!(
                            zone = %zone,
                            error = %reason,
                            failures,
                            cooldown_secs = self.config.cooldown.as_secs(),
                            "Retry ceiling reached, cooling down"
                        );
                        ZoneState::CoolDown
                    } else {
                        let delay = self.config.backoff.delay_for_attempt(failures - 1);
                        warn!(
                            zone = %zone,
                            error = %reason,
                            attempt = failures,
                            max = self.config.backoff.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "Zone stream failed, backing off"
                        );
                        ZoneState::Backoff { delay }
                    }
                }

                ZoneState::Backoff { delay } => {
                    if !sleep_or_cancel(&token, delay).await {
                        break;
                    }
                    ZoneState::Provisioning
                }

                ZoneState::CoolDown => {
                    if !sleep_or_cancel(&token, self.config.cooldown).await {
                        break;
                    }
                    failures = 0;
                    ZoneState::Provisioning
                }
            };
        }

        info!(zone = %zone, "Zone worker stopped");
        Ok(())
    }

    /// Read frames until the connection is lost or the token fires.
    async fn stream(
        &self,
        zone: &str,
        mut frames: FrameStream,
        token: &CancellationToken,
    ) -> StreamEnd {
        let mut received: u64 = 0;
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return StreamEnd::Cancelled,
                next = frames.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(Error::MalformedPayload(reason))) => {
                    warn!(zone, error = %reason, "Dropping undecodable frame");
                    continue;
                }
                Some(Err(e)) => return StreamEnd::Lost(e.to_string()),
                None => return StreamEnd::Lost(format!("stream closed after {received} events")),
            };

            for decoded in decode_frame(&frame, zone) {
                match decoded {
                    Ok(event) => {
                        received += 1;
                        self.enricher
                            .enrich_with(&event, |alert| self.publisher.submit(&alert));
                    }
                    Err(e) => warn!(zone, error = %e, "Dropping malformed frame"),
                }
            }
        }
    }
}

impl ZoneRunner for StreamIngestor {
    fn run_zone(&self, zone: String, token: CancellationToken) -> BoxFuture<'static, Result<()>> {
        Box::pin(self.clone().run(zone, token))
    }
}

enum StreamEnd {
    Cancelled,
    Lost(String),
}

/// Returns `false` if cancelled first.
async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
