//! One viewer connection as seen by the rest of the relay.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

pub type ClientId = Uuid;

/// Viewer connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Handle to a viewer's outbound queue.
///
/// The socket task owns the receiving end and writes to the socket; the
/// broadcaster only ever touches this handle.
pub struct ClientHandle {
    id: ClientId,
    addr: Option<SocketAddr>,
    outbox: mpsc::Sender<String>,
    state: Mutex<ClientState>,
    close: CancellationToken,
}

impl ClientHandle {
    /// New handle in `Connecting` state. `close` is cancelled to ask the
    /// socket task to shut the connection down.
    pub fn new(
        addr: Option<SocketAddr>,
        outbox_capacity: usize,
        close: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbox, rx) = mpsc::channel(outbox_capacity.max(1));
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            addr,
            outbox,
            state: Mutex::new(ClientState::Connecting),
            close,
        });
        (handle, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Move forward in the lifecycle. Backward moves and moves out of
    /// `Closed` are ignored; returns whether the state changed.
    pub fn transition(&self, next: ClientState) -> bool {
        let mut state = self.state.lock();
        let allowed = matches!(
            (*state, next),
            (ClientState::Connecting, ClientState::Open)
                | (ClientState::Connecting, ClientState::Closing)
                | (ClientState::Connecting, ClientState::Closed)
                | (ClientState::Open, ClientState::Closing)
                | (ClientState::Open, ClientState::Closed)
                | (ClientState::Closing, ClientState::Closed)
        );
        if allowed {
            *state = next;
        }
        allowed
    }

    /// Queue a text frame, waiting at most `timeout` for room.
    pub async fn send(&self, payload: String, timeout: Duration) -> Result<()> {
        if self.state() != ClientState::Open {
            return Err(Error::client_send(self.id, format!("connection is {}", self.state())));
        }
        match tokio::time::timeout(timeout, self.outbox.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::client_send(self.id, "connection closed")),
            Err(_) => Err(Error::client_send(
                self.id,
                format!("send timed out after {}ms", timeout.as_millis()),
            )),
        }
    }

    /// Ask the socket task to close the connection.
    pub fn close(&self) {
        self.transition(ClientState::Closing);
        self.close.cancel();
    }

    pub fn close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.close
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        let (handle, _rx) = ClientHandle::new(None, 4, CancellationToken::new());
        assert_eq!(handle.state(), ClientState::Connecting);
        assert!(handle.transition(ClientState::Open));
        assert!(!handle.transition(ClientState::Connecting));
        assert!(handle.transition(ClientState::Closing));
        assert!(!handle.transition(ClientState::Open));
        assert!(handle.transition(ClientState::Closed));
        assert!(!handle.transition(ClientState::Open));
        assert!(!handle.transition(ClientState::Closing));
        assert_eq!(handle.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let (handle, mut rx) = ClientHandle::new(None, 4, CancellationToken::new());
        let err = handle
            .send("{}".into(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClientSend { .. }));

        handle.transition(ClientState::Open);
        handle.send("{}".into(), Duration::from_millis(10)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "{}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_when_full() {
        let (handle, _rx) = ClientHandle::new(None, 1, CancellationToken::new());
        handle.transition(ClientState::Open);
        handle.send("a".into(), Duration::from_secs(1)).await.unwrap();
        let err = handle.send("b".into(), Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (handle, rx) = ClientHandle::new(None, 1, CancellationToken::new());
        handle.transition(ClientState::Open);
        drop(rx);
        let err = handle.send("a".into(), Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("connection closed"));
    }

    #[test]
    fn test_close_cancels_token() {
        let (handle, _rx) = ClientHandle::new(None, 1, CancellationToken::new());
        handle.transition(ClientState::Open);
        handle.close();
        assert!(handle.close_requested());
        assert_eq!(handle.state(), ClientState::Closing);
    }
}
