//! Process wiring for the ingest and relay services.

use std::path::Path;
use std::sync::Arc;

use pubsub::{Broker, LocalBroker, RedisBroker};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BrokerSettings, IngestSettings, RelaySettings};
use crate::enrich::Enricher;
use crate::error::{Error, Result};
use crate::geo::{GeoLookup, MaxMindLookup, NoGeoLookup};
use crate::ingest::{CloudflareProvisioner, StreamIngestor, WebSocketConnector};
use crate::publish::Publisher;
use crate::relay::{Broadcaster, ClientRegistry, RelayServer};
use crate::supervisor::Supervisor;

/// Which half of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ingest,
    Relay,
    /// Both halves over an in-process broker.
    Standalone,
}

/// Load configuration for `mode` and run until `token` is cancelled.
pub async fn run(mode: Mode, token: CancellationToken) -> Result<()> {
    let broker_settings = BrokerSettings::from_env()?;

    match mode {
        Mode::Ingest => {
            let settings = IngestSettings::from_env()?;
            let broker = redis_broker(&broker_settings)?;
            run_ingest(broker, &broker_settings, settings, token).await
        }
        Mode::Relay => {
            let settings = RelaySettings::from_env()?;
            let broker = redis_broker(&broker_settings)?;
            run_relay(broker, &broker_settings, settings, token).await
        }
        Mode::Standalone => {
            let ingest = IngestSettings::from_env()?;
            let relay = RelaySettings::from_env()?;
            let broker: Arc<dyn Broker> = Arc::new(LocalBroker::new());
            run_standalone(broker, &broker_settings, ingest, relay, token).await
        }
    }
}

fn redis_broker(settings: &BrokerSettings) -> Result<Arc<dyn Broker>> {
    let broker = RedisBroker::open(&settings.redis_url)
        .map_err(|e| Error::config(format!("invalid REDIS_URL {:?}: {e}", settings.redis_url)))?;
    Ok(Arc::new(broker))
}

fn open_geo(path: Option<&Path>) -> Result<Arc<dyn GeoLookup>> {
    match path {
        Some(path) => Ok(Arc::new(MaxMindLookup::open(path)?)),
        None => {
            warn!("GEOIP_DB_PATH is empty, every source will resolve to Unknown");
            Ok(Arc::new(NoGeoLookup))
        }
    }
}

/// Provision, stream, enrich and publish every configured zone.
pub async fn run_ingest(
    broker: Arc<dyn Broker>,
    broker_settings: &BrokerSettings,
    settings: IngestSettings,
    token: CancellationToken,
) -> Result<()> {
    let geo = open_geo(settings.geoip_db_path.as_deref())?;
    let provisioner = CloudflareProvisioner::new(
        settings.api_base.clone(),
        settings.credentials.clone(),
        settings.request_timeout,
    )?;

    let enricher = Enricher::new(geo, settings.destination.clone());

    // Separate token so queued alerts still drain after the workers stop.
    let publisher_token = CancellationToken::new();
    let (publisher, publisher_task) = Publisher::spawn(
        broker,
        settings.publisher_config(broker_settings),
        publisher_token.clone(),
    );
    let stats = publisher.stats();

    let ingestor = StreamIngestor::new(
        Arc::new(provisioner),
        Arc::new(WebSocketConnector::default()),
        enricher,
        publisher,
        settings.reconnect.clone(),
    );

    info!(
        zones = settings.zones.len(),
        channel = %broker_settings.channel,
        "Ingest starting"
    );
    let supervisor = Supervisor::with_config(
        Arc::new(ingestor),
        token,
        settings.supervisor_config(),
    );
    let report = supervisor.run(settings.zones.clone()).await;

    // Every publisher handle went away with the workers; the drain task
    // exits once the queue is empty.
    if tokio::time::timeout(settings.shutdown_timeout, publisher_task)
        .await
        .is_err()
    {
        warn!("Publisher did not drain before the shutdown timeout");
        publisher_token.cancel();
    }

    info!(
        workers = report.total_workers,
        graceful = report.graceful_stops,
        forced = report.forced_terminations,
        published = stats.published(),
        dropped = stats.dropped(),
        "Ingest stopped"
    );
    Ok(())
}

/// Serve viewers and relay every broker message to them.
pub async fn run_relay(
    broker: Arc<dyn Broker>,
    broker_settings: &BrokerSettings,
    settings: RelaySettings,
    token: CancellationToken,
) -> Result<()> {
    let registry = Arc::new(ClientRegistry::new());
    let server = RelayServer::new(settings.server.clone(), registry.clone(), token.clone());
    let listener = server.bind().await?;

    let broadcaster = Broadcaster::new(
        broker,
        registry,
        settings.broadcaster_config(broker_settings),
    );
    let broadcaster_task = tokio::spawn(broadcaster.run(token.clone()));

    let result = server.serve(listener).await;
    if let Err(e) = &result {
        error!(error = %e, "Relay server failed");
    }
    token.cancel();

    if let Err(e) = broadcaster_task.await {
        error!(error = %e, "Broadcaster task panicked");
    }
    info!("Relay stopped");
    result
}

/// Both halves in one process. A failure in either stops the other.
pub async fn run_standalone(
    broker: Arc<dyn Broker>,
    broker_settings: &BrokerSettings,
    ingest: IngestSettings,
    relay: RelaySettings,
    token: CancellationToken,
) -> Result<()> {
    let ingest_half = async {
        let result = run_ingest(broker.clone(), broker_settings, ingest, token.clone()).await;
        if result.is_err() {
            token.cancel();
        }
        result
    };
    let relay_half = async {
        let result = run_relay(broker.clone(), broker_settings, relay, token.clone()).await;
        if result.is_err() {
            token.cancel();
        }
        result
    };

    let (ingest_result, relay_result) = tokio::join!(ingest_half, relay_half);
    ingest_result.and(relay_result)
}

/// Cancel `token` on Ctrl-C or SIGTERM.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvSource;

    #[test]
    fn test_open_geo_without_path() {
        let geo = open_geo(None).unwrap();
        assert_eq!(geo.resolve("8.8.8.8").country, "Unknown");
    }

    #[test]
    fn test_open_geo_missing_file_is_fatal() {
        let err = match open_geo(Some(Path::new("/nonexistent/GeoLite2-City.mmdb"))) {
            Err(e) => e,
            Ok(_) => panic!("expected missing database to fail"),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_redis_url_is_fatal() {
        let settings = BrokerSettings {
            redis_url: "not-a-url".to_string(),
            ..Default::default()
        };
        let err = match redis_broker(&settings) {
            Err(e) => e,
            Ok(_) => panic!("expected invalid URL to fail"),
        };
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_ingest_fails_fast_on_missing_geo_db() {
        let settings = IngestSettings::from_source(&EnvSource::from_pairs([
            ("CLOUDFLARE_API_KEY", "secret"),
            ("CLOUDFLARE_EMAIL", "ops@example.com"),
            ("ATTACK_MAP_ZONES", "zone-a"),
            ("GEOIP_DB_PATH", "/nonexistent/GeoLite2-City.mmdb"),
        ]))
        .unwrap();
        let result = run_ingest(
            Arc::new(LocalBroker::new()),
            &BrokerSettings::default(),
            settings,
            CancellationToken::new(),
        )
        .await;
        assert!(result.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_relay_stops_on_cancel() {
        let settings = RelaySettings::from_source(&EnvSource::from_pairs([
            ("MAP_SERVER_BIND", "127.0.0.1"),
            ("MAP_SERVER_PORT", "0"),
        ]))
        .unwrap();
        let token = CancellationToken::new();
        let broker_settings = BrokerSettings::default();
        let stop = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        };
        let relay = run_relay(
            Arc::new(LocalBroker::new()),
            &broker_settings,
            settings,
            token.clone(),
        );
        let (result, ()) = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            tokio::join!(relay, stop)
        })
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
