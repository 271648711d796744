//! Alert data model: raw edge events in, enriched alerts out.

pub mod event;
pub mod model;
pub mod service;

pub use event::{RawEvent, decode_frame};
pub use model::{AggregateSnapshot, Destination, EVENT_TIME_FORMAT, EnrichedAlert};
pub use service::ServiceCategory;

/// Alert category for edge traffic.
pub const ALERT_TYPE: &str = "Traffic";
/// Sensor label shown on the map.
pub const HONEYPOT: &str = "Cloudflare";
/// Reputation placeholder; no reputation source is wired in.
pub const IP_REPUTATION: &str = "Unknown";
pub const EDGE_PROTOCOL: &str = "HTTPS";
pub const EDGE_DST_PORT: u16 = 443;
pub const EDGE_SRC_PORT: u16 = 0;
