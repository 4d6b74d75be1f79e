//! Immutable topology snapshots delivered by the cluster coordinator.

use std::sync::Arc;

use crate::topology::ConsistentHash;
use crate::types::{NodeId, TopologyId};

/// A membership and ownership snapshot.
///
/// During a rebalance two consistent hashes are held: reads use the current
/// ownership while writes use the pending one, so that new owners accept
/// writes while they are being populated. Outside a rebalance there is no
/// pending hash and both sides resolve to the current one.
#[derive(Debug, Clone)]
pub struct CacheTopology {
    topology_id: TopologyId,
    members: Vec<NodeId>,
    current_ch: Arc<ConsistentHash>,
    pending_ch: Option<Arc<ConsistentHash>>,
}

impl CacheTopology {
    /// Create a topology snapshot.
    pub fn new(
        topology_id: TopologyId,
        members: Vec<NodeId>,
        current_ch: Arc<ConsistentHash>,
        pending_ch: Option<Arc<ConsistentHash>>,
    ) -> Self {
        Self {
            topology_id,
            members,
            current_ch,
            pending_ch,
        }
    }

    /// The monotonically increasing topology id.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Members of this topology.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Check whether a node is a member of this topology.
    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    /// The consistent hash reads are served with.
    pub fn read_ch(&self) -> &Arc<ConsistentHash> {
        &self.current_ch
    }

    /// The consistent hash writes go through: the pending assignment during a
    /// rebalance, otherwise the current one.
    pub fn write_ch(&self) -> &Arc<ConsistentHash> {
        self.pending_ch.as_ref().unwrap_or(&self.current_ch)
    }

    /// The pending consistent hash, present only while a rebalance is in
    /// progress.
    pub fn pending_ch(&self) -> Option<&Arc<ConsistentHash>> {
        self.pending_ch.as_ref()
    }
}
