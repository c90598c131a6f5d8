//! Presence directory: which identities are online, and where.
//!
//! Each identity has at most one live endpoint. A reconnect replaces the
//! previous endpoint (last writer wins). Mutation is atomic per identity and
//! different identities live in different shards of the map.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use pqchat_crypto::Identity;

use crate::protocol::ServerFrame;

/// Connection identifier, unique for the lifetime of the process.
pub type ConnectionId = u64;

/// The outbound half of a live client connection.
#[derive(Debug, Clone)]
pub struct Endpoint {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

impl Endpoint {
    pub fn new(connection_id: ConnectionId, tx: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a frame for the connection's writer.
    ///
    /// Returns false if the connection has already gone away.
    pub fn push(&self, frame: ServerFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct PresenceDirectory {
    online: DashMap<Identity, Endpoint>,
    next_connection_id: AtomicU64,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self {
            online: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Mark `identity` online at `endpoint`, returning the endpoint it replaced.
    pub fn connect(&self, identity: Identity, endpoint: Endpoint) -> Option<Endpoint> {
        self.online.insert(identity, endpoint)
    }

    /// Mark `identity` offline if it is still registered by `connection_id`.
    ///
    /// A stale connection closing after its identity reconnected elsewhere
    /// leaves the newer endpoint in place. Calling this twice is harmless.
    pub fn disconnect(&self, identity: &Identity, connection_id: ConnectionId) -> bool {
        self.online
            .remove_if(identity, |_, endpoint| endpoint.connection_id == connection_id)
            .is_some()
    }

    /// Live endpoint for `identity`.
    ///
    /// An endpoint whose writer has gone away is evicted here, so a dead
    /// connection never keeps swallowing deliveries.
    pub fn lookup(&self, identity: &Identity) -> Option<Endpoint> {
        let endpoint = self.online.get(identity).map(|entry| entry.value().clone())?;
        if endpoint.is_closed() {
            self.disconnect(identity, endpoint.connection_id());
            return None;
        }
        Some(endpoint)
    }

    #[cfg(test)]
    pub fn is_online(&self, identity: &Identity) -> bool {
        self.online.contains_key(identity)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Snapshot of online identities, sorted for stable output.
    pub fn online_identities(&self) -> Vec<Identity> {
        let mut ids: Vec<Identity> = self.online.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl Default for PresenceDirectory {
    fn default() -> Self {
        Self::new()
    }
}
