//! Named pub/sub components known to the sidecar.
//!
//! Entries are immutable once inserted and handed out as `Arc`s, so a
//! lookup never holds the lock while the caller awaits the backend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::access::ScopingRule;
use crate::component::PubSubComponent;

/// A registered component with its scoping configuration.
pub struct PubSubEntry {
    pub name: String,
    pub component: Arc<dyn PubSubComponent>,
    pub scoping: ScopingRule,
    /// Topics are prefixed with the app namespace before reaching the backend.
    pub namespace_scoped: bool,
}

impl PubSubEntry {
    pub fn new(name: impl Into<String>, component: Arc<dyn PubSubComponent>) -> Self {
        Self {
            name: name.into(),
            component,
            scoping: ScopingRule::unrestricted(),
            namespace_scoped: false,
        }
    }

    pub fn with_scoping(mut self, scoping: ScopingRule) -> Self {
        self.scoping = scoping;
        self
    }

    pub fn with_namespace_scoped(mut self, namespace_scoped: bool) -> Self {
        self.namespace_scoped = namespace_scoped;
        self
    }
}

impl std::fmt::Debug for PubSubEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubEntry")
            .field("name", &self.name)
            .field("scoping", &self.scoping)
            .field("namespace_scoped", &self.namespace_scoped)
            .finish_non_exhaustive()
    }
}

/// Thread-safe name → component map.
#[derive(Default)]
pub struct ComponentRegistry {
    pubsubs: RwLock<HashMap<String, Arc<PubSubEntry>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry`, replacing any component with the same name.
    pub fn insert(&self, entry: PubSubEntry) -> Option<Arc<PubSubEntry>> {
        self.pubsubs
            .write()
            .insert(entry.name.clone(), Arc::new(entry))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<PubSubEntry>> {
        self.pubsubs.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PubSubEntry>> {
        self.pubsubs.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pubsubs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pubsubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pubsubs.read().is_empty()
    }
}
