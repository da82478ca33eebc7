//! Registry of connected clients

use crate::connection::TunnelClient;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Maps client ids to their live control connection
///
/// At most one connection per id; registering an id that is already present
/// replaces the previous connection and hands it back to the caller.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Arc<TunnelClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, returning the connection it replaced, if any
    pub fn register(&self, id: impl Into<String>, client: Arc<TunnelClient>) -> Option<Arc<TunnelClient>> {
        let id = id.into();
        debug!("Registering client {} ({})", id, client.connection_id());
        self.clients.insert(id, client)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<TunnelClient>> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Remove `id` only if it still maps to `expected`
    ///
    /// A connection tearing down after it was replaced must not remove its
    /// successor.
    pub fn unregister(&self, id: &str, expected: &Arc<TunnelClient>) -> bool {
        let removed = self
            .clients
            .remove_if(id, |_, current| Arc::ptr_eq(current, expected))
            .is_some();

        if removed {
            debug!("Unregistered client {} ({})", id, expected.connection_id());
        }
        removed
    }

    pub fn list(&self) -> Vec<Arc<TunnelClient>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Clients with no inbound activity for longer than `max_idle`
    pub fn idle_clients(&self, max_idle: Duration) -> Vec<Arc<TunnelClient>> {
        self.clients
            .iter()
            .filter(|entry| entry.value().idle_for() > max_idle)
            .map(|entry| entry.value().clone())
            .collect()
    }
}
