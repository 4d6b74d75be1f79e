//! Consistent-hash mapping from segments to ordered owner lists.
//!
//! Keys hash into a fixed number of segments; each segment is owned by an
//! ordered list of nodes. The first owner is the primary; owners appended by
//! later rebalances sit towards the end of the list.

use std::collections::HashSet;
use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::error::{Error, Result};
use crate::types::{NodeId, SegmentId};

/// A consistent-hash ownership assignment over a fixed segment space.
///
/// Instances are immutable; a topology update replaces the whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentHash {
    /// Number of segments keys hash into.
    num_segments: u32,

    /// Members participating in this assignment.
    members: Vec<NodeId>,

    /// Ordered owner list per segment, indexed by segment id.
    segment_owners: Vec<Vec<NodeId>>,
}

impl ConsistentHash {
    /// Create an assignment by spreading segments over `members`.
    ///
    /// Segment `s` is owned by `owners_per_segment` distinct members starting
    /// at `s % members.len()`. Deterministic, so every node derives the same
    /// assignment from the same inputs.
    pub fn new(num_segments: u32, owners_per_segment: usize, members: Vec<NodeId>) -> Self {
        let owners_per_segment = owners_per_segment.max(1).min(members.len().max(1));
        let mut segment_owners = Vec::with_capacity(num_segments as usize);
        for segment in 0..num_segments as usize {
            let owners = if members.is_empty() {
                Vec::new()
            } else {
                (0..owners_per_segment)
                    .map(|i| members[(segment + i) % members.len()])
                    .collect()
            };
            segment_owners.push(owners);
        }
        Self {
            num_segments,
            members,
            segment_owners,
        }
    }

    /// Create an assignment from an explicit owner list per segment.
    ///
    /// Used by the topology coordinator, which computes assignments itself.
    pub fn from_owners(members: Vec<NodeId>, segment_owners: Vec<Vec<NodeId>>) -> Result<Self> {
        if segment_owners.is_empty() {
            return Err(Error::Config("segment owner table must not be empty".into()));
        }
        for (segment, owners) in segment_owners.iter().enumerate() {
            if let Some(owner) = owners.iter().find(|owner| !members.contains(*owner)) {
                return Err(Error::Config(format!(
                    "owner {} of segment {} is not a member",
                    owner, segment
                )));
            }
        }
        Ok(Self {
            num_segments: segment_owners.len() as u32,
            members,
            segment_owners,
        })
    }

    /// Number of segments in this assignment.
    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// Members participating in this assignment.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Check if a node is a member of this assignment.
    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    /// Ordered owner list for a segment. The first owner is the primary.
    pub fn owners(&self, segment: SegmentId) -> &[NodeId] {
        self.segment_owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Segments for which `node` appears in the owner list.
    ///
    /// Returns the empty set if the node is not a member.
    pub fn segments_for_owner(&self, node: NodeId) -> HashSet<SegmentId> {
        if !self.contains(node) {
            return HashSet::new();
        }
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(&node))
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// The segment a key hashes into.
    ///
    /// Segment mapping depends only on the key and the segment count, never
    /// on the owner table, so any assignment version gives the same answer.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        (hasher.finish() % self.num_segments as u64) as SegmentId
    }

    /// Check if a key is local to a node under this assignment.
    pub fn is_key_local(&self, node: NodeId, key: &[u8]) -> bool {
        self.owners(self.segment_of(key)).contains(&node)
    }
}
