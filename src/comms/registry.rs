//! In-memory registry of guest connections, keyed by machine id

use crate::comms::link::Connection;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, machine_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(machine_id).cloned()
    }

    /// Existing entry for `machine_id`, or a fresh disconnected one
    pub fn get_or_create(&self, machine_id: &str) -> Arc<Connection> {
        if let Some(conn) = self.get(machine_id) {
            return conn;
        }
        self.connections
            .write()
            .entry(machine_id.to_string())
            .or_insert_with(|| Arc::new(Connection::new(machine_id)))
            .clone()
    }

    pub fn remove(&self, machine_id: &str) -> Option<Arc<Connection>> {
        self.connections.write().remove(machine_id)
    }

    /// All entries, sorted by machine id
    pub fn all(&self) -> Vec<Arc<Connection>> {
        let mut all: Vec<_> = self.connections.read().values().cloned().collect();
        all.sort_by(|a, b| a.machine_id().cmp(b.machine_id()));
        all
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections.write().drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_stable() {
        let registry = ConnectionRegistry::new();
        let first = registry.get_or_create("vm-1");
        let again = registry.get_or_create("vm-1");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_sorted_listing_and_removal() {
        let registry = ConnectionRegistry::new();
        for id in ["vm-c", "vm-a", "vm-b"] {
            registry.get_or_create(id);
        }
        let ids: Vec<_> = registry
            .all()
            .iter()
            .map(|c| c.machine_id().to_string())
            .collect();
        assert_eq!(ids, vec!["vm-a", "vm-b", "vm-c"]);

        assert!(registry.remove("vm-b").is_some());
        assert!(registry.get("vm-b").is_none());
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.all().is_empty());
    }
}
