//! Live attack map relay.
//!
//! The ingest half provisions an edge log stream per zone, enriches each
//! blocked request with geolocation and running aggregates, and publishes
//! it to a broker channel. The relay half subscribes to that channel and
//! fans every message out to connected map viewers over WebSocket.

pub mod alert;
pub mod app;
pub mod backoff;
pub mod config;
pub mod enrich;
pub mod error;
pub mod geo;
pub mod ingest;
pub mod logging;
pub mod publish;
pub mod relay;
pub mod supervisor;
pub mod tls;

pub use error::{Error, Result};
