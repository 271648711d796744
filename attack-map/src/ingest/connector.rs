//! Persistent streaming connections.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::debug;

use crate::error::{Error, Result};
use crate::tls::install_rustls_provider;

/// Text frames from one connection. Ends when the peer closes; an `Err`
/// item is a connection-level failure.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Opens a frame stream for a provisioned endpoint.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<FrameStream>;
}

/// WebSocket client connector.
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        install_rustls_provider();
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream> {
        let (ws, response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                Error::network(format!(
                    "connect timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })??;
        debug!(status = %response.status(), "WebSocket handshake complete");

        // Pings are answered by tungstenite while reading.
        let frames = futures::stream::unfold(ws, |mut ws| async move {
            loop {
                match ws.next().await? {
                    Ok(Message::Text(text)) => return Some((Ok(text.as_str().to_owned()), ws)),
                    Ok(Message::Binary(data)) => {
                        let item = String::from_utf8(data.to_vec())
                            .map_err(|e| Error::malformed(format!("binary frame is not UTF-8: {e}")));
                        return Some((item, ws));
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Stream closed by peer");
                        return None;
                    }
                    Ok(_) => continue,
                    Err(e) => return Some((Err(e.into()), ws)),
                }
            }
        });

        Ok(frames.boxed())
    }
}
