//! Object registries
//!
//! - [`ObjectRegistry`]: named callback objects published by the peer
//!   (e.g. `"Watchdog"`). Filled in after the peer connects, so readers poll.
//! - [`ObjectTable`]: gateway objects handed out to the peer by id.

use super::object::GatewayObject;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Registry key of the peer's liveness object
pub const WATCHDOG_KEY: &str = "Watchdog";

/// Name → callback object map shared by sessions and the watchdog
#[derive(Default)]
pub struct ObjectRegistry {
    entries: RwLock<HashMap<String, Arc<dyn GatewayObject>>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the object registered under `name`
    pub fn register(&self, name: impl Into<String>, object: Arc<dyn GatewayObject>) {
        let name = name.into();
        debug!("Registered callback object {}", name);
        self.entries.write().insert(name, object);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn GatewayObject>> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn GatewayObject>> {
        self.entries.write().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Id → object map for values returned to the peer
pub struct ObjectTable {
    next_id: AtomicU64,
    objects: RwLock<HashMap<String, Arc<dyn GatewayObject>>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        ObjectTable {
            next_id: AtomicU64::new(1),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Store `object` and return its freshly generated id
    pub fn insert(&self, object: Arc<dyn GatewayObject>) -> String {
        let id = format!("o{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.objects.write().insert(id.clone(), object);
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn GatewayObject>> {
        self.objects.read().get(id).cloned()
    }

    pub fn release(&self, id: &str) -> bool {
        self.objects.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.objects.write().clear();
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
