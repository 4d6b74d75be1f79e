//! Notification and L1 collaborator seams.

use std::collections::HashSet;

use bytes::Bytes;

use crate::commands::ClusterListenerSpec;
use crate::error::Result;
use crate::topology::ConsistentHash;
use crate::types::{NodeId, SegmentId, TopologyId};

/// Seam to the cache's listener notification machinery.
pub trait CacheNotifier: Send + Sync + std::fmt::Debug {
    /// Data is being rehashed. Emitted with `is_pre == true` when a rebalance
    /// starts and once with `is_pre == false` when it ends.
    fn data_rehashed(
        &self,
        read_ch: &ConsistentHash,
        write_ch: &ConsistentHash,
        topology_id: TopologyId,
        is_pre: bool,
    );

    /// This node finished receiving all segments it owns under the pending
    /// ownership.
    fn rebalance_complete(&self, topology_id: TopologyId);

    /// Install a cluster listener advertised by another member.
    fn register_cluster_listener(&self, listener: &ClusterListenerSpec) -> Result<()>;
}

/// Seam to the L1 cache manager.
///
/// Owners track which nodes hold a key in L1 (the key's requestors) so they
/// can invalidate those copies on update.
pub trait L1Manager: Send + Sync + std::fmt::Debug {
    /// Record that `node` holds `key` in L1 and must be invalidated on
    /// update.
    fn add_requestor(&self, key: &Bytes, node: NodeId);
}

/// L1 manager for caches without an L1.
#[derive(Debug, Default)]
pub struct NoL1;

impl L1Manager for NoL1 {
    fn add_requestor(&self, _key: &Bytes, _node: NodeId) {}
}

/// Observer invoked right before segment invalidation runs.
pub trait KeyInvalidationListener: Send + Sync {
    /// Called with the segments the node keeps and the segments about to be
    /// demoted to L1.
    fn before_invalidation(
        &self,
        new_segments: &HashSet<SegmentId>,
        segments_to_l1: &HashSet<SegmentId>,
    );
}
