//! Per-viewer socket task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::client::{ClientHandle, ClientState};
use super::registry::ClientRegistry;

/// Socket-level settings for viewer connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Ping period. A ping left unanswered for a full period closes the connection.
    pub heartbeat_interval: Duration,
    /// Budget for one socket write.
    pub write_timeout: Duration,
    /// Frames queued per viewer before sends start waiting.
    pub outbox_capacity: usize,
    /// Echo viewer text frames back (diagnostics).
    pub echo_client_frames: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            write_timeout: Duration::from_millis(2000),
            outbox_capacity: 64,
            echo_client_frames: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    ProtocolError,
    HeartbeatTimeout,
    WriteFailed,
    Evicted,
    Shutdown,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client closed",
            Self::ProtocolError => "protocol error",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::WriteFailed => "write failed",
            Self::Evicted => "evicted",
            Self::Shutdown => "server shutdown",
        }
    }

    /// Close frame to send, if the socket is still usable.
    fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            Self::Shutdown => (close_code::AWAY, "server shutting down"),
            Self::Evicted => (close_code::POLICY, "too slow"),
            Self::HeartbeatTimeout => (close_code::POLICY, "heartbeat timeout"),
            _ => return None,
        };
        Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })
    }
}

type Sender = SplitSink<WebSocket, Message>;

async fn write(sender: &mut Sender, msg: Message, timeout: Duration) -> bool {
    matches!(tokio::time::timeout(timeout, sender.send(msg)).await, Ok(Ok(())))
}

/// Drive one viewer connection from handshake to close.
///
/// The client is registered for the lifetime of this call and always
/// removed from `registry` before it returns.
pub async fn run_connection(
    socket: WebSocket,
    addr: Option<SocketAddr>,
    registry: Arc<ClientRegistry>,
    config: ConnectionConfig,
    shutdown: CancellationToken,
) {
    let (handle, mut outbox) =
        ClientHandle::new(addr, config.outbox_capacity, shutdown.child_token());
    let client_id = handle.id();

    if !registry.add(handle.clone()) {
        debug!(%client_id, "Duplicate client id, dropping connection");
        handle.transition(ClientState::Closed);
        return;
    }
    handle.transition(ClientState::Open);
    info!(%client_id, addr = ?addr, viewers = registry.len(), "Viewer connected");

    let (mut sender, mut receiver) = socket.split();
    let period = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut awaiting_pong = false;

    let reason = loop {
        tokio::select! {
            _ = handle.close_token().cancelled() => {
                break if shutdown.is_cancelled() {
                    CloseReason::Shutdown
                } else {
                    CloseReason::Evicted
                };
            }

            queued = outbox.recv() => {
                let Some(text) = queued else { break CloseReason::Evicted };
                if !write(&mut sender, Message::Text(text.into()), config.write_timeout).await {
                    break CloseReason::WriteFailed;
                }
            }

            incoming = receiver.next() => {
                // Any frame counts as liveness.
                awaiting_pong = false;
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if config.echo_client_frames {
                            if !write(&mut sender, Message::Text(text), config.write_timeout).await {
                                break CloseReason::WriteFailed;
                            }
                        } else {
                            trace!(%client_id, len = text.len(), "Ignoring viewer frame");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if !write(&mut sender, Message::Pong(data), config.write_timeout).await {
                            break CloseReason::WriteFailed;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                    Some(Err(e)) => {
                        debug!(%client_id, error = %e, "Viewer socket error");
                        break CloseReason::ProtocolError;
                    }
                    Some(Ok(_)) => {}
                }
            }

            _ = heartbeat.tick() => {
                if awaiting_pong {
                    break CloseReason::HeartbeatTimeout;
                }
                if !write(&mut sender, Message::Ping(Bytes::new()), config.write_timeout).await {
                    break CloseReason::WriteFailed;
                }
                awaiting_pong = true;
            }
        }
    };

    handle.transition(ClientState::Closing);
    registry.remove(&client_id);

    if let Some(frame) = reason.close_frame() {
        let _ = write(&mut sender, Message::Close(Some(frame)), config.write_timeout).await;
    }
    let _ = tokio::time::timeout(config.write_timeout, sender.close()).await;

    handle.transition(ClientState::Closed);
    info!(
        %client_id,
        reason = reason.as_str(),
        viewers = registry.len(),
        "Viewer disconnected"
    );
}
