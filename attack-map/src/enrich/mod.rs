//! Geolocation plus running counters.

mod aggregate;
mod enricher;

pub use aggregate::AggregateState;
pub use enricher::Enricher;
