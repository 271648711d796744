//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Only [`Error::Configuration`] is allowed to stop the process; every other
/// variant is handled where it occurs (retried, dropped or isolated).
#[derive(Error, Debug)]
pub enum Error {
    /// Socket or connection failure. Retried with backoff.
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// A frame or message that could not be parsed. Dropped and logged.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The endpoint provisioning API failed. Retried on the next supervisory tick.
    #[error("Provisioning failed for zone {zone}: {reason}")]
    Provisioning { zone: String, reason: String },

    /// Delivery to a single viewer failed or timed out.
    #[error("Send to client {client_id} failed: {reason}")]
    ClientSend { client_id: String, reason: String },

    /// Missing or invalid setting at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Broker error: {0}")]
    Broker(#[from] pubsub::BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    pub fn provisioning(zone: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provisioning {
            zone: zone.into(),
            reason: reason.into(),
        }
    }

    pub fn client_send(client_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::ClientSend {
            client_id: client_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransientNetwork(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::TransientNetwork(e.to_string())
    }
}
