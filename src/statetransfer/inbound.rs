//! Inbound transfer tasks: the state machine for one (source, segment-set)
//! pull.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;
use tracing::trace;

use crate::error::{Error, Result};
use crate::types::{NodeId, SegmentId, TopologyId};

/// Identifier of an inbound transfer task within the registry.
///
/// The transfer pump references tasks by id only; the registry owns them.
pub type TaskId = u64;

/// Lifecycle state of an inbound transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created, waiting in the ready queue.
    New,
    /// The start request was sent; chunks are expected.
    Running,
    /// All segments received their last chunk.
    Completed,
    /// The start request failed or timed out.
    Failed,
    /// The task was cancelled, locally or by topology change.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One pull of a set of segments from a single source node.
///
/// The task tracks which segments still need their last chunk and signals
/// waiters when it reaches a terminal state. It never performs I/O itself;
/// RPCs are driven by the consumer so no lock is held across the network.
#[derive(Debug)]
pub struct InboundTransferTask {
    id: TaskId,
    source: NodeId,
    topology_id: TopologyId,
    /// Segments currently assigned to this task. Shrinks when segments are
    /// cancelled.
    segments: HashSet<SegmentId>,
    /// Segments that have not received their last chunk yet.
    pending: HashSet<SegmentId>,
    status: TaskStatus,
    status_tx: watch::Sender<TaskStatus>,
    status_rx: watch::Receiver<TaskStatus>,
}

impl InboundTransferTask {
    /// Create a task for pulling `segments` from `source`.
    pub fn new(
        id: TaskId,
        source: NodeId,
        segments: HashSet<SegmentId>,
        topology_id: TopologyId,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(TaskStatus::New);
        Self {
            id,
            source,
            topology_id,
            pending: segments.clone(),
            segments,
            status: TaskStatus::New,
            status_tx,
            status_rx,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Segments currently assigned to this task.
    pub fn segments(&self) -> &HashSet<SegmentId> {
        &self.segments
    }

    /// Segments that have not received their last chunk yet.
    pub fn pending_segments(&self) -> &HashSet<SegmentId> {
        &self.pending
    }

    /// Sorted copy of the assigned segments, for requests and logs.
    pub fn sorted_segments(&self) -> Vec<SegmentId> {
        let mut segments: Vec<_> = self.segments.iter().copied().collect();
        segments.sort_unstable();
        segments
    }

    /// Mark the task as picked up by the transfer pump.
    pub fn mark_running(&mut self) {
        if !self.status.is_terminal() {
            self.set_status(TaskStatus::Running);
        }
    }

    /// Mark the task as failed (start request rejected or timed out).
    pub fn mark_failed(&mut self) {
        if !self.status.is_terminal() {
            self.set_status(TaskStatus::Failed);
        }
    }

    /// Record an incoming chunk for a segment. Only the last chunk of a
    /// segment settles it; once no segment is pending the task completes.
    pub fn on_state_received(&mut self, segment: SegmentId, is_last_chunk: bool) {
        if is_last_chunk && self.pending.remove(&segment) {
            trace!(task = self.id, segment, "Last chunk received for segment");
            if self.pending.is_empty() && !self.status.is_terminal() {
                self.set_status(TaskStatus::Completed);
            }
        }
    }

    /// Drop a subset of segments from this task. If nothing is left pending
    /// the task is cancelled. The caller owns sending the cancel RPC.
    pub fn cancel_segments(&mut self, subset: &HashSet<SegmentId>) {
        self.segments.retain(|s| !subset.contains(s));
        self.pending.retain(|s| !subset.contains(s));
        if self.pending.is_empty() && !self.status.is_terminal() {
            self.set_status(TaskStatus::Cancelled);
        }
    }

    /// Forcibly stop the task locally. Used when the source already left the
    /// cluster, so no RPC is sent.
    pub fn terminate(&mut self) {
        if !self.status.is_terminal() {
            self.set_status(TaskStatus::Cancelled);
        }
    }

    /// A handle waiters use to observe the task's terminal state without
    /// holding the registry lock.
    pub fn completion_handle(&self) -> TaskCompletion {
        TaskCompletion {
            rx: self.status_rx.clone(),
        }
    }

    fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        let _ = self.status_tx.send(status);
    }
}

/// Waitable view of a task's status.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    rx: watch::Receiver<TaskStatus>,
}

impl TaskCompletion {
    /// Wait until the task reaches a terminal state.
    ///
    /// Returns [`Error::Timeout`] after `timeout` and [`Error::Interrupted`]
    /// if the task side went away.
    pub async fn wait(mut self, timeout: Duration) -> Result<TaskStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = *self.rx.borrow_and_update();
            if status.is_terminal() {
                return Ok(status);
            }
            match tokio::time::timeout_at(deadline, self.rx.changed()).await {
                Err(_) => return Err(Error::Timeout),
                Ok(Err(_)) => return Err(Error::Interrupted),
                Ok(Ok(())) => {}
            }
        }
    }

    /// The task's current status.
    pub fn status(&self) -> TaskStatus {
        *self.rx.borrow()
    }
}
