//! The broker seam shared by publishers and subscribers.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// A live subscription: one item per message received on the channel.
///
/// The stream ends when the subscription is lost. An `Err` item reports a
/// message that could not be decoded; the subscription itself stays usable.
pub type Subscription = BoxStream<'static, Result<String>>;

/// A named-channel pub/sub transport.
///
/// Delivery is at-most-once: a subscriber only sees messages published while
/// its subscription is active.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Backend name used in logs (e.g., "local", "redis").
    fn name(&self) -> &str;

    /// Publish a text payload on `channel`.
    ///
    /// Returns the number of subscribers the backend reports as having received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Open a subscription on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
