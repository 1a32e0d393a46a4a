use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::connection::{Connection, ConnectionId};

/// All live connections, keyed by the id that travels with their descriptors.
///
/// The registry lock is never held while acquiring a connection's lock: callers look up a
///  connection, release the registry, and only then lock the connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<FxHashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        Default::default()
    }

    /// hands out a fresh id; ids are never reused
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        trace!("registering connection {}", connection.id());
        self.connections.lock().unwrap()
            .insert(connection.id(), connection);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap()
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        trace!("unregistering connection {}", id);
        self.connections.lock().unwrap()
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// all registered connections at the time of the call
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap()
            .values()
            .cloned()
            .collect()
    }
}
