//! Zone stream ingestion.
//!
//! Each zone gets its own [`StreamIngestor`] loop: provision an endpoint,
//! connect, read frames, enrich and publish, and reconnect with backoff
//! when the connection drops.

mod connector;
mod provision;
mod worker;

pub use connector::{FrameStream, StreamConnector, WebSocketConnector};
pub use provision::{
    BLOCKED_FILTER, CloudflareCredentials, CloudflareProvisioner, LOG_FIELDS, Provisioner,
};
pub use worker::{ReconnectConfig, StreamIngestor, ZoneRunner, ZoneState};
