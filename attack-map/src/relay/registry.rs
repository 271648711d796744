//! Set of live viewer connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::client::{ClientHandle, ClientId};

/// Concurrency-safe viewer set.
///
/// Readers get point-in-time copies from [`ClientRegistry::snapshot`]; the
/// map itself never escapes the lock.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Returns `false` if the id is already present.
    pub fn add(&self, client: Arc<ClientHandle>) -> bool {
        let mut clients = self.clients.write();
        if clients.contains_key(&client.id()) {
            return false;
        }
        clients.insert(client.id(), client);
        true
    }

    /// Remove a client. Removing an absent client is a no-op.
    pub fn remove(&self, id: &ClientId) -> Option<Arc<ClientHandle>> {
        let removed = self.clients.write().remove(id);
        if removed.is_some() {
            debug!(client_id = %id, "Client removed from registry");
        }
        removed
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.read().contains_key(id)
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}
