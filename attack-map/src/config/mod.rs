//! Process configuration from environment variables.
//!
//! `.env` is loaded by the binary before any of this runs. Every setting
//! has a default except the credentials and zone list ingestion needs;
//! a missing or unparseable value is an [`Error::Configuration`].

mod env;

use std::path::PathBuf;
use std::time::Duration;

use crate::alert::Destination;
use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::ingest::{CloudflareCredentials, ReconnectConfig};
use crate::publish::PublisherConfig;
use crate::relay::{BroadcasterConfig, ConnectionConfig, RelayServerConfig};
use crate::supervisor::SupervisorConfig;

pub use env::EnvSource;

pub const DEFAULT_REDIS_URL: &str = "redis://map_redis:6379";
pub const DEFAULT_CHANNEL: &str = "attack-map-production";
pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_GEOIP_DB: &str = "GeoLite2-City.mmdb";

/// Broker connection shared by both halves.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub redis_url: String,
    pub channel: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

impl BrokerSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_source(&EnvSource::process())
    }

    pub fn from_source(env: &EnvSource) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            redis_url: env.string_or("REDIS_URL", &defaults.redis_url),
            channel: env.string_or("BROKER_CHANNEL", &defaults.channel),
        })
    }
}

/// Everything the ingest half needs.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub credentials: CloudflareCredentials,
    pub api_base: String,
    pub zones: Vec<String>,
    /// `None` disables geolocation; every source resolves to Unknown.
    pub geoip_db_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub publish_timeout: Duration,
    pub publish_queue_capacity: usize,
    pub destination: Destination,
    pub shutdown_timeout: Duration,
}

impl IngestSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_source(&EnvSource::process())
    }

    pub fn from_source(env: &EnvSource) -> Result<Self> {
        let credentials = CloudflareCredentials {
            api_key: env.required("CLOUDFLARE_API_KEY")?,
            email: env.required("CLOUDFLARE_EMAIL")?,
        };

        let zones = parse_zones(&env.required("ATTACK_MAP_ZONES")?);
        if zones.is_empty() {
            return Err(Error::config("ATTACK_MAP_ZONES has no zone ids"));
        }

        let geoip_db_path = match env.get("GEOIP_DB_PATH") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path.trim())),
            None => Some(PathBuf::from(DEFAULT_GEOIP_DB)),
        };

        let base_delay = Duration::from_millis(env.parse_or("RECONNECT_INITIAL_DELAY_MS", 1000)?);
        let max_delay = Duration::from_millis(env.parse_or("RECONNECT_MAX_DELAY_MS", 30_000)?);
        if base_delay.is_zero() || max_delay < base_delay {
            return Err(Error::config(
                "RECONNECT_MAX_DELAY_MS must be at least RECONNECT_INITIAL_DELAY_MS (> 0)",
            ));
        }

        let reconnect = ReconnectConfig {
            backoff: BackoffPolicy {
                max_retries: env.parse_or("RECONNECT_MAX_RETRIES", 5)?,
                base_delay,
                max_delay,
                jitter: false,
            },
            cooldown: Duration::from_secs(env.parse_or("RECONNECT_COOLDOWN_SECS", 10)?),
            provision_retry: Duration::from_secs(env.parse_or("PROVISION_RETRY_SECS", 5)?),
        };

        let defaults = Destination::default();
        let destination = Destination {
            latitude: env.parse_or("DST_LATITUDE", defaults.latitude)?,
            longitude: env.parse_or("DST_LONGITUDE", defaults.longitude)?,
            iso_code: env.string_or("DST_ISO_CODE", &defaults.iso_code),
            country_name: env.string_or("DST_COUNTRY_NAME", &defaults.country_name),
        };

        Ok(Self {
            credentials,
            api_base: env.string_or("CLOUDFLARE_API_BASE", DEFAULT_API_BASE),
            zones,
            geoip_db_path,
            request_timeout: Duration::from_secs(env.parse_or("PROVISION_TIMEOUT_SECS", 30)?),
            reconnect,
            publish_timeout: Duration::from_millis(env.parse_or("PUBLISH_TIMEOUT_MS", 1000)?),
            publish_queue_capacity: env.parse_or("PUBLISH_QUEUE_CAPACITY", 1024)?,
            destination,
            shutdown_timeout: Duration::from_secs(env.parse_or("SHUTDOWN_TIMEOUT_SECS", 10)?),
        })
    }

    pub fn publisher_config(&self, broker: &BrokerSettings) -> PublisherConfig {
        PublisherConfig {
            channel: broker.channel.clone(),
            publish_timeout: self.publish_timeout,
            queue_capacity: self.publish_queue_capacity,
            ..Default::default()
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            shutdown_timeout: self.shutdown_timeout,
            ..Default::default()
        }
    }
}

/// Everything the relay half needs.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub server: RelayServerConfig,
    pub send_timeout: Duration,
    pub subscribe_retry: Duration,
}

impl RelaySettings {
    pub fn from_env() -> Result<Self> {
        Self::from_source(&EnvSource::process())
    }

    pub fn from_source(env: &EnvSource) -> Result<Self> {
        let send_timeout = Duration::from_millis(env.parse_or("CLIENT_SEND_TIMEOUT_MS", 2000)?);
        let heartbeat_interval = Duration::from_secs(env.parse_or("HEARTBEAT_INTERVAL_SECS", 30)?);
        if heartbeat_interval.is_zero() {
            return Err(Error::config("HEARTBEAT_INTERVAL_SECS must be greater than 0"));
        }

        let defaults = RelayServerConfig::default();
        Ok(Self {
            server: RelayServerConfig {
                bind_address: env.string_or("MAP_SERVER_BIND", &defaults.bind_address),
                port: env.parse_or("MAP_SERVER_PORT", defaults.port)?,
                connection: ConnectionConfig {
                    heartbeat_interval,
                    write_timeout: send_timeout,
                    echo_client_frames: env.flag("ECHO_CLIENT_FRAMES")?,
                    ..ConnectionConfig::default()
                },
                shutdown_timeout: Duration::from_secs(env.parse_or("SHUTDOWN_TIMEOUT_SECS", 10)?),
            },
            send_timeout,
            subscribe_retry: Duration::from_secs(env.parse_or("SUBSCRIBE_RETRY_SECS", 5)?),
        })
    }

    pub fn broadcaster_config(&self, broker: &BrokerSettings) -> BroadcasterConfig {
        BroadcasterConfig {
            channel: broker.channel.clone(),
            send_timeout: self.send_timeout,
            subscribe_retry: self.subscribe_retry,
        }
    }
}

/// Comma or whitespace separated, duplicates removed, order kept.
pub fn parse_zones(raw: &str) -> Vec<String> {
    let mut zones: Vec<String> = Vec::new();
    for zone in raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|z| !z.is_empty())
    {
        if !zones.iter().any(|z| z == zone) {
            zones.push(zone.to_string());
        }
    }
    zones
}
