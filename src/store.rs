//! Concurrent snapshot of routing configurations
//!
//! Keyed by routing key. Lookups on the request path are wait-free; the
//! single loader replaces whole `DomainConfig` values, so a reader always
//! sees either the old or the new configuration for a key, never a partial
//! one.

use crate::domain::DomainConfig;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Default)]
pub struct ConfigStore {
    entries: DashMap<String, Arc<DomainConfig>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the configuration for a routing key
    pub fn get(&self, routing_key: &str) -> Option<Arc<DomainConfig>> {
        self.entries.get(routing_key).map(|e| Arc::clone(e.value()))
    }

    /// Publish a new snapshot: upsert every config, then drop keys that are
    /// no longer present.
    pub fn publish(&self, snapshot: Vec<Arc<DomainConfig>>) {
        let keys: HashSet<String> = snapshot.iter().map(|c| c.routing_key.clone()).collect();

        for config in snapshot {
            self.entries.insert(config.routing_key.clone(), config);
        }

        self.entries.retain(|key, _| keys.contains(key));
    }

    /// First configuration satisfying the predicate, if any. Iteration
    /// order is unspecified.
    pub fn first_match<F>(&self, mut predicate: F) -> Option<Arc<DomainConfig>>
    where
        F: FnMut(&DomainConfig) -> bool,
    {
        self.entries
            .iter()
            .find(|entry| predicate(entry.value().as_ref()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Currently published routing keys
    pub fn routing_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
