//! Viewer relay: broker subscription, client registry and the WebSocket
//! endpoint viewers connect to.

mod broadcaster;
mod client;
mod connection;
mod registry;
mod server;

pub use broadcaster::{BroadcastReport, Broadcaster, BroadcasterConfig, SubscriptionState};
pub use client::{ClientHandle, ClientId, ClientState};
pub use connection::{ConnectionConfig, run_connection};
pub use registry::ClientRegistry;
pub use server::{RelayServer, RelayServerConfig};
