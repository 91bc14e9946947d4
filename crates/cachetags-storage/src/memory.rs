//! In-process registry.
//!
//! Associations live in a map owned by this instance, so it only sees
//! registrations made by the same process. Useful for tests and for
//! single-process servers that rebuild their cache on restart anyway.

use async_trait::async_trait;
use cachetags_core::error::Result;
use cachetags_core::traits::{latest_per_path, InspectableRegistry, Registry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Paths registered under one tag, in first-registration order.
#[derive(Debug, Default)]
struct TagEntry {
    order: Vec<String>,
    registered_at: HashMap<String, DateTime<Utc>>,
}

impl TagEntry {
    fn touch(&mut self, path: &str, at: DateTime<Utc>) {
        if self.registered_at.insert(path.to_string(), at).is_none() {
            self.order.push(path.to_string());
        }
    }
}

/// Registry backed by a process-local map.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    store: Mutex<HashMap<String, TagEntry>>,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tags with at least one path
    pub fn tag_count(&self) -> usize {
        self.store.lock().len()
    }

    /// Paths currently associated with `tag`, without extracting them
    pub fn paths(&self, tag: &str) -> Vec<String> {
        self.store
            .lock()
            .get(tag)
            .map(|entry| entry.order.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, path: &str, tags: &[String]) -> Result<()> {
        let now = Utc::now();
        let mut store = self.store.lock();

        for tag in tags {
            store.entry(tag.clone()).or_default().touch(path, now);
        }

        debug!(path, tags = tags.len(), "Registered path in memory");
        Ok(())
    }

    async fn extract(&self, tag: &str) -> Result<Vec<String>> {
        let paths = self
            .store
            .lock()
            .remove(tag)
            .map(|entry| entry.order)
            .unwrap_or_default();

        debug!(tag, paths = paths.len(), "Extracted paths from memory");
        Ok(paths)
    }
}

#[async_trait]
impl InspectableRegistry for MemoryRegistry {
    async fn cache_info(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        let store = self.store.lock();
        Ok(latest_per_path(store.values().flat_map(|entry| {
            entry
                .registered_at
                .iter()
                .map(|(path, at)| (path.clone(), *at))
        })))
    }

    async fn clear(&self) -> Result<()> {
        self.store.lock().clear();
        Ok(())
    }
}
