//! Core types used throughout the cache node.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Node identifier in the cluster.
pub type NodeId = u64;

/// One of the fixed number of partitions a key may hash into.
pub type SegmentId = u32;

/// Monotonically increasing identifier of a membership/ownership snapshot.
pub type TopologyId = u64;

/// A cache entry as it travels between nodes during state transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cache key.
    pub key: Bytes,

    /// The cache value.
    pub value: Bytes,

    /// Absolute expiration time in nanoseconds since UNIX epoch.
    /// None means no expiration.
    pub expires_at_nanos: Option<u64>,
}

impl CacheEntry {
    /// Create a new entry without expiration.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expires_at_nanos: None,
        }
    }

    /// Create a new entry with an absolute expiration time.
    pub fn with_expiration(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expires_at: SystemTime,
    ) -> Self {
        let expires_at_nanos = expires_at
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos() as u64);

        Self {
            key: key.into(),
            value: value.into(),
            expires_at_nanos,
        }
    }

    /// Create a new entry with a remaining TTL.
    pub fn with_ttl(key: impl Into<Bytes>, value: impl Into<Bytes>, ttl: Duration) -> Self {
        Self::with_expiration(key, value, SystemTime::now() + ttl)
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at_nanos.map_or(false, |expires| {
            let now_nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            expires <= now_nanos
        })
    }
}

/// Counters describing the work done by the state consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateTransferStats {
    /// Chunks accepted and routed to an inbound task.
    pub chunks_applied: u64,
    /// Entries written into the local container.
    pub entries_applied: u64,
    /// Entries skipped because a user write already touched the key.
    pub entries_skipped: u64,
    /// Inbound tasks that finished receiving all their segments.
    pub tasks_completed: u64,
    /// Inbound tasks that failed and were re-queued against another source.
    pub tasks_retried: u64,
}
