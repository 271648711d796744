//! pubsub: the broker channel between alert ingestion and alert relay.
//!
//! ## Core Types
//!
//! - [`Broker`] - Trait for a named-channel publish/subscribe transport
//! - [`Subscription`] - Stream of messages for one subscription
//!
//! ## Backends
//!
//! - [`LocalBroker`] - In-process channels, for single-binary deployments and tests
//! - [`RedisBroker`] - Redis PUBLISH/SUBSCRIBE, for split ingest/relay deployments

pub mod broker;
pub mod error;
pub mod local;
pub mod redis_broker;

pub use broker::{Broker, Subscription};
pub use error::{BrokerError, Result};
pub use local::LocalBroker;
pub use redis_broker::RedisBroker;
