//! Bounded, non-blocking publishing of alerts onto the broker channel.

mod publisher;

pub use publisher::{Publisher, PublisherConfig, PublisherStats};
