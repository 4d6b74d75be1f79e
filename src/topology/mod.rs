//! Cluster topology: consistent-hash segment ownership and topology
//! snapshots.

mod cache_topology;
mod consistent_hash;

pub use cache_topology::CacheTopology;
pub use consistent_hash::ConsistentHash;
