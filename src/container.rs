//! Local data container and persistence seams.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;
use crate::types::CacheEntry;

/// Read-only view of the node's in-memory data container.
///
/// State transfer never writes through this trait; writes go through the
/// interceptor chain. The container is only enumerated when segments are
/// invalidated after an ownership change.
pub trait DataContainer: Send + Sync + std::fmt::Debug {
    /// Snapshot of all keys currently held.
    fn keys(&self) -> Vec<Bytes>;

    /// Number of entries currently held.
    fn len(&self) -> usize;

    /// Whether the container holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Seam to the persistence layer.
#[async_trait]
pub trait PersistenceManager: Send + Sync + std::fmt::Debug {
    /// Enumerate keys present in any configured store, skipping keys in
    /// `exclude` (those are already visible through the data container).
    async fn stored_keys(&self, exclude: &HashSet<Bytes>) -> Result<Vec<Bytes>>;
}

/// Persistence manager for nodes with no configured stores.
#[derive(Debug, Default)]
pub struct NoStores;

#[async_trait]
impl PersistenceManager for NoStores {
    async fn stored_keys(&self, _exclude: &HashSet<Bytes>) -> Result<Vec<Bytes>> {
        Ok(Vec::new())
    }
}

/// Simple hash-map backed data container.
///
/// The production container sits behind the interceptor chain; this one
/// backs the in-process harness and any embedded single-node deployments.
#[derive(Debug, Default)]
pub struct MapDataContainer {
    entries: RwLock<HashMap<Bytes, CacheEntry>>,
}

impl MapDataContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value stored under a key.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    /// Insert an entry, replacing any previous value for the key.
    pub fn insert(&self, entry: CacheEntry) {
        self.entries.write().insert(entry.key.clone(), entry);
    }

    /// Remove an entry.
    pub fn remove(&self, key: &[u8]) -> Option<CacheEntry> {
        self.entries.write().remove(key)
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries.read().values().cloned().collect()
    }
}

impl DataContainer for MapDataContainer {
    fn keys(&self) -> Vec<Bytes> {
        self.entries.read().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
