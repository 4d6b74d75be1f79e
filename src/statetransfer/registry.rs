//! Registry of in-flight inbound transfers.
//!
//! Two mutually consistent indexes (by source and by segment) plus the
//! ordered ready queue the transfer pump drains. The registry owns every
//! task; all mutations happen under one lock held by the consumer, and the
//! two indexes are only ever updated together.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use crate::statetransfer::inbound::{InboundTransferTask, TaskId};
use crate::types::{NodeId, SegmentId, TopologyId};

/// A cancel RPC to send after the registry lock is released.
///
/// The registry never performs I/O; mutations collect the RPCs they imply
/// and hand them back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CancelAction {
    pub source: NodeId,
    pub topology_id: TopologyId,
    pub segments: Vec<SegmentId>,
}

#[derive(Debug, Default)]
pub(crate) struct TransferRegistry {
    next_task_id: TaskId,
    tasks: HashMap<TaskId, InboundTransferTask>,
    /// Tasks per source. Multiple transfers can flow in from the same source
    /// for different segments.
    by_source: HashMap<NodeId, Vec<TaskId>>,
    /// At most one task per segment.
    by_segment: HashMap<SegmentId, TaskId>,
    /// Tasks ready for the transfer pump, oldest first.
    ready: VecDeque<TaskId>,
}

impl TransferRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a transfer of `segments` from `source`.
    ///
    /// Segments that already have an in-flight task are dropped; if none
    /// remain no task is created.
    pub(crate) fn add_transfer(
        &mut self,
        source: NodeId,
        mut segments: HashSet<SegmentId>,
        topology_id: TopologyId,
    ) -> Option<TaskId> {
        segments.retain(|s| !self.by_segment.contains_key(s));
        if segments.is_empty() {
            return None;
        }

        self.next_task_id += 1;
        let id = self.next_task_id;
        trace!(task = id, source, ?segments, "Adding inbound transfer");

        for &segment in &segments {
            self.by_segment.insert(segment, id);
        }
        self.by_source.entry(source).or_default().push(id);
        self.ready.push_back(id);
        self.tasks
            .insert(id, InboundTransferTask::new(id, source, segments, topology_id));
        Some(id)
    }

    pub(crate) fn task(&self, id: TaskId) -> Option<&InboundTransferTask> {
        self.tasks.get(&id)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut InboundTransferTask> {
        self.tasks.get_mut(&id)
    }

    /// The task currently delivering a segment, if any.
    pub(crate) fn task_for_segment(&self, segment: SegmentId) -> Option<TaskId> {
        self.by_segment.get(&segment).copied()
    }

    /// Pop the oldest runnable task.
    pub(crate) fn pop_ready(&mut self) -> Option<TaskId> {
        self.ready.pop_front()
    }

    /// Remove a task from the queue and both indexes.
    ///
    /// Returns the removed task so callers can inspect its segments, or
    /// `None` if it was already removed.
    pub(crate) fn remove_transfer(&mut self, id: TaskId) -> Option<InboundTransferTask> {
        let task = self.tasks.remove(&id)?;
        trace!(task = id, source = task.source(), "Removing inbound transfer");

        self.ready.retain(|t| *t != id);
        if let Some(list) = self.by_source.get_mut(&task.source()) {
            list.retain(|t| *t != id);
            if list.is_empty() {
                self.by_source.remove(&task.source());
            }
        }
        for segment in task.segments() {
            if self.by_segment.get(segment) == Some(&id) {
                self.by_segment.remove(segment);
            }
        }
        Some(task)
    }

    /// Cancel the in-flight transfers of segments this node no longer owns.
    ///
    /// Each affected task loses the intersection of its segments with
    /// `removed`; a task whose segment set becomes empty is removed
    /// entirely. Returns the cancel RPCs to send once the lock is released.
    pub(crate) fn cancel_transfers(
        &mut self,
        removed: &HashSet<SegmentId>,
    ) -> Vec<CancelAction> {
        let mut actions = Vec::new();
        let mut to_cancel: Vec<SegmentId> = removed.iter().copied().collect();

        while let Some(segment) = to_cancel.pop() {
            let Some(&task_id) = self.by_segment.get(&segment) else {
                // transfer already completed or never requested
                continue;
            };
            let task = self
                .tasks
                .get_mut(&task_id)
                .expect("segment index points at a live task");

            let cancelled: HashSet<SegmentId> = task
                .segments()
                .intersection(removed)
                .copied()
                .collect();
            to_cancel.retain(|s| !cancelled.contains(s));
            for s in &cancelled {
                self.by_segment.remove(s);
            }

            let mut segments: Vec<_> = cancelled.iter().copied().collect();
            segments.sort_unstable();
            actions.push(CancelAction {
                source: task.source(),
                topology_id: task.topology_id(),
                segments,
            });

            task.cancel_segments(&cancelled);
            if task.segments().is_empty() {
                self.remove_transfer(task_id);
            }
        }
        actions
    }

    /// Terminate every task whose source is no longer in `members` and
    /// return the segments those tasks had not finished, so they can be
    /// re-requested from a live owner. No cancel RPC is implied: the sources
    /// are gone.
    pub(crate) fn terminate_broken_sources(
        &mut self,
        members: &HashSet<NodeId>,
    ) -> HashSet<SegmentId> {
        let broken: Vec<NodeId> = self
            .by_source
            .keys()
            .filter(|source| !members.contains(*source))
            .copied()
            .collect();

        let mut restarted = HashSet::new();
        for source in broken {
            trace!(source, "Removing inbound transfers from a source that left");
            let task_ids = self.by_source.remove(&source).unwrap_or_default();
            for id in task_ids {
                self.ready.retain(|t| *t != id);
                if let Some(mut task) = self.tasks.remove(&id) {
                    for segment in task.segments() {
                        self.by_segment.remove(segment);
                    }
                    restarted.extend(task.pending_segments().iter().copied());
                    task.terminate();
                }
            }
        }
        restarted
    }

    /// Whether any transfer is still in flight.
    pub(crate) fn has_active(&self) -> bool {
        !self.by_source.is_empty()
    }

    /// Cancel everything. Used on shutdown; returns the cancel RPCs for the
    /// segments that were still pending.
    pub(crate) fn clear(&mut self) -> Vec<CancelAction> {
        let mut actions = Vec::new();
        for task in self.tasks.values_mut() {
            if !task.pending_segments().is_empty() {
                let mut segments: Vec<_> = task.pending_segments().iter().copied().collect();
                segments.sort_unstable();
                actions.push(CancelAction {
                    source: task.source(),
                    topology_id: task.topology_id(),
                    segments,
                });
            }
            task.terminate();
        }
        self.tasks.clear();
        self.by_source.clear();
        self.by_segment.clear();
        self.ready.clear();
        actions
    }

    #[cfg(test)]
    pub(crate) fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Assert index coherence: every task is indexed under its source, every
    /// segment of every task maps back to it, and no stale ids linger.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for (&id, task) in &self.tasks {
            let listed = self
                .by_source
                .get(&task.source())
                .map(|l| l.iter().filter(|t| **t == id).count())
                .unwrap_or(0);
            assert_eq!(listed, 1, "task {} must appear once under its source", id);
            for segment in task.segments() {
                assert_eq!(
                    self.by_segment.get(segment),
                    Some(&id),
                    "segment {} must map to task {}",
                    segment,
                    id
                );
            }
        }
        for (&segment, &id) in &self.by_segment {
            let task = self.tasks.get(&id).expect("segment index has no stale task");
            assert!(task.segments().contains(&segment));
        }
        for list in self.by_source.values() {
            assert!(!list.is_empty(), "empty source entries must be dropped");
            for id in list {
                assert!(self.tasks.contains_key(id));
            }
        }
        for id in &self.ready {
            assert!(self.tasks.contains_key(id), "ready queue has no stale tasks");
        }
    }
}
