//! Broker error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised by a broker backend.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker could not be reached or the connection dropped.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A payload could not be read off the channel.
    #[error("Payload error: {0}")]
    Payload(String),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a payload error.
    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            Self::Payload(_) | Self::Other(_) => false,
        }
    }
}
