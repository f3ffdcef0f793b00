//! Live connections and the capacity limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use conduit_core::ConnectionId;
use parking_lot::RwLock;

use super::connection::ClientConnection;

/// Tracks live connections. Capacity is reserved before a connection is
/// registered, so concurrent upgrades cannot overshoot the limit.
pub(crate) struct ConnectionRegistry {
    max_connections: usize,
    reserved: Arc<AtomicUsize>,
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

/// A held capacity slot; released on drop.
#[derive(Debug)]
pub(crate) struct CapacitySlot {
    reserved: Arc<AtomicUsize>,
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        let _ = self.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnectionRegistry {
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            reserved: Arc::new(AtomicUsize::new(0)),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Reserve a slot, or `None` at capacity.
    pub(crate) fn try_reserve(&self) -> Option<CapacitySlot> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .ok()
            .map(|_| CapacitySlot {
                reserved: Arc::clone(&self.reserved),
            })
    }

    pub(crate) fn insert(&self, connection: Arc<ClientConnection>) {
        let _ = self
            .connections
            .write()
            .insert(connection.id.clone(), connection);
    }

    pub(crate) fn remove(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.write().remove(id)
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// Snapshot of live connections, taken without holding the lock afterwards.
    pub(crate) fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.read().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.read().len()
    }
}
