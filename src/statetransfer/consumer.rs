//! The state consumer: the inbound side of rebalancing on a single node.
//!
//! The consumer reconciles topology updates pushed by the cluster
//! coordinator, decides which segments to pull, fetches prepared transactions
//! and entry chunks from remote owners, applies them locally, cancels or
//! retries broken transfers and reports completion. User writes always win
//! over state-transfer writes for the same key.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::commands::{
    CommandInvoker, InvocationContext, RpcManager, StateChunk, StateRequest, StateResponse,
    WriteCommand, WriteFlags,
};
use crate::config::StateTransferConfig;
use crate::container::{DataContainer, PersistenceManager};
use crate::error::{Error, Result};
use crate::events::{CacheNotifier, KeyInvalidationListener, L1Manager};
use crate::statetransfer::inbound::{TaskId, TaskStatus};
use crate::statetransfer::registry::{CancelAction, TransferRegistry};
use crate::statetransfer::updated_keys::UpdatedKeys;
use crate::topology::{CacheTopology, ConsistentHash};
use crate::txn::{TotalOrderManager, TransactionInfo, TransactionManager, TransactionTable};
use crate::types::{CacheEntry, NodeId, SegmentId, StateTransferStats, TopologyId};

/// Operating mode of the cache.
///
/// Each mode carries the collaborators it needs, so the consumer dispatches
/// on the variant instead of testing scattered flags and nullable handles.
#[derive(Clone)]
pub enum CacheMode {
    /// Non-transactional distributed cache.
    NonTx,

    /// Transactional cache using the default two-phase protocol.
    Tx {
        manager: Arc<dyn TransactionManager>,
        table: Arc<dyn TransactionTable>,
    },

    /// Transactional cache using the total-order protocol.
    TxTotalOrder {
        manager: Arc<dyn TransactionManager>,
        table: Arc<dyn TransactionTable>,
        total_order: Arc<dyn TotalOrderManager>,
    },

    /// Invalidation-mode cache.
    Invalidation,
}

impl CacheMode {
    /// Whether the cache is transactional.
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Tx { .. } | Self::TxTotalOrder { .. })
    }

    /// Whether the cache uses the total-order protocol.
    pub fn is_total_order(&self) -> bool {
        matches!(self, Self::TxTotalOrder { .. })
    }

    /// Whether the cache runs in invalidation mode.
    pub fn is_invalidation(&self) -> bool {
        matches!(self, Self::Invalidation)
    }

    fn transaction_manager(&self) -> Option<&Arc<dyn TransactionManager>> {
        match self {
            Self::Tx { manager, .. } | Self::TxTotalOrder { manager, .. } => Some(manager),
            _ => None,
        }
    }

    fn transaction_table(&self) -> Option<&Arc<dyn TransactionTable>> {
        match self {
            Self::Tx { table, .. } | Self::TxTotalOrder { table, .. } => Some(table),
            _ => None,
        }
    }

    fn total_order_manager(&self) -> Option<&Arc<dyn TotalOrderManager>> {
        match self {
            Self::TxTotalOrder { total_order, .. } => Some(total_order),
            _ => None,
        }
    }
}

impl std::fmt::Debug for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonTx => write!(f, "NonTx"),
            Self::Tx { .. } => write!(f, "Tx"),
            Self::TxTotalOrder { .. } => write!(f, "TxTotalOrder"),
            Self::Invalidation => write!(f, "Invalidation"),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    chunks_applied: AtomicU64,
    entries_applied: AtomicU64,
    entries_skipped: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_retried: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> StateTransferStats {
        StateTransferStats {
            chunks_applied: self.chunks_applied.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            entries_skipped: self.entries_skipped.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
        }
    }
}

/// Inbound side of state transfer for one cache.
///
/// Per-cache instance with an explicit lifecycle: [`start`](Self::start)
/// spawns the transfer pump, [`stop`](Self::stop) cancels every in-flight
/// transfer and shuts the pump down.
pub struct StateConsumer {
    local_node: NodeId,
    config: StateTransferConfig,
    mode: CacheMode,

    /// Self-reference handed to the pump so it never keeps the consumer
    /// alive.
    weak_self: Weak<StateConsumer>,

    rpc: Arc<dyn RpcManager>,
    invoker: Arc<dyn CommandInvoker>,
    data_container: Arc<dyn DataContainer>,
    persistence: Arc<dyn PersistenceManager>,
    notifier: Arc<dyn CacheNotifier>,
    l1_manager: Arc<dyn L1Manager>,

    /// Current topology snapshot. Written exclusively only in the narrow
    /// window that swaps the snapshot and installs the updated-keys set.
    topology: RwLock<Option<CacheTopology>>,

    /// Keys updated by user code during the rebalance. Replaced atomically;
    /// readers snapshot the `Arc` before use so a concurrent
    /// `stop_applying_state` cannot invalidate it mid-check.
    updated_keys: RwLock<Option<Arc<UpdatedKeys>>>,

    registry: Mutex<TransferRegistry>,

    /// Sources that already failed in this topology; not retried until the
    /// next topology update.
    excluded_sources: Mutex<HashSet<NodeId>>,

    rebalance_in_progress: AtomicBool,
    waiting_for_state: AtomicBool,
    owns_data: AtomicBool,
    fetch_enabled: AtomicBool,
    pump_started: AtomicBool,

    transfer_notify: Arc<Notify>,
    shutdown: CancellationToken,

    topology_installed_tx: watch::Sender<TopologyId>,
    topology_installed_rx: watch::Receiver<TopologyId>,
    transaction_data_tx: watch::Sender<TopologyId>,
    transaction_data_rx: watch::Receiver<TopologyId>,

    key_invalidation_listener: RwLock<Option<Arc<dyn KeyInvalidationListener>>>,

    counters: Counters,
}

impl std::fmt::Debug for StateConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateConsumer")
            .field("local_node", &self.local_node)
            .field("mode", &self.mode)
            .field("rebalance_in_progress", &self.is_state_transfer_in_progress())
            .field("owns_data", &self.owns_data())
            .finish()
    }
}

impl StateConsumer {
    /// Start building a consumer for `local_node`.
    pub fn builder(
        local_node: NodeId,
        config: StateTransferConfig,
        mode: CacheMode,
    ) -> StateConsumerBuilder {
        StateConsumerBuilder::new(local_node, config, mode)
    }

    /// Scan the configuration and spawn the transfer pump.
    pub fn start(&self) {
        self.fetch_enabled
            .store(self.config.fetch_enabled(), Ordering::SeqCst);
        if self.pump_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(Self::pump_loop(self.weak_self.clone()));
    }

    /// Cancel all inbound transfers and shut the pump down.
    pub async fn stop(&self) {
        trace!(node = self.local_node, "Shutting down state consumer");
        self.shutdown.cancel();
        let actions = self.registry.lock().clear();
        for action in actions {
            self.send_cancel(action).await;
        }
    }

    // ---- topology reactor ------------------------------------------------

    /// Entry point for topology updates pushed by the cluster coordinator.
    ///
    /// Updates are expected in topology-id order; an id lower than the
    /// current one is ignored. Only interruption escapes this method; all
    /// transport and per-entry failures are absorbed and retried.
    pub async fn on_topology_update(
        &self,
        topology: CacheTopology,
        is_rebalance: bool,
    ) -> Result<()> {
        let topology_id = topology.topology_id();
        let previous = self.get_cache_topology();
        if let Some(ref current) = previous {
            if topology_id < current.topology_id() {
                debug!(
                    topology_id,
                    current = current.topology_id(),
                    "Ignoring topology older than the current one"
                );
                return Ok(());
            }
        }

        let is_member = topology.is_member(self.local_node);
        debug!(topology_id, is_rebalance, is_member, "Received new topology");

        if is_rebalance {
            if !self.owns_data.load(Ordering::SeqCst) && is_member {
                self.owns_data.store(true, Ordering::SeqCst);
            }
            self.rebalance_in_progress.store(true, Ordering::SeqCst);
            self.notifier
                .data_rehashed(topology.read_ch(), topology.write_ch(), topology_id, true);

            // In total order we must wait for remote transactions prepared
            // under the previous topology before proceeding.
            if let Some(total_order) = self.mode.total_order_manager() {
                trace!("Waiting for in-flight total-order transactions to drain");
                for mut latch in total_order.state_transfer_start(topology_id) {
                    latch.await_unblock().await?;
                }
                trace!("All in-flight total-order transactions finished");
            }
        } else if topology.members().len() == 1 && topology.members()[0] == self.local_node {
            // first and only member of the cache
            self.owns_data.store(true, Ordering::SeqCst);
        }

        // The completion check must not fire until every new task has been
        // registered, even if some tasks are removed and re-added meanwhile.
        self.waiting_for_state.store(false, Ordering::SeqCst);
        self.excluded_sources.lock().clear();

        let previous_read_ch = previous.as_ref().map(|t| t.read_ch().clone());
        let previous_write_ch = previous.as_ref().map(|t| t.write_ch().clone());

        {
            let mut guard = self.topology.write();
            *guard = Some(topology.clone());
            if is_rebalance {
                trace!("Start keeping track of keys updated during the rebalance");
                *self.updated_keys.write() = Some(Arc::new(UpdatedKeys::new()));
            }
        }
        let _ = self.topology_installed_tx.send(topology_id);

        let result = self
            .handle_segment_changes(&topology, previous_write_ch, previous_read_ch.clone(), is_member)
            .await;

        if result.is_ok()
            && self.rebalance_in_progress.load(Ordering::SeqCst)
            && !is_rebalance
            && topology.pending_ch().is_none()
        {
            // A topology without a pending assignment ends the rebalance.
            // Duplicate coordinator updates may race here; the CAS makes
            // sure the post-rehash notification is emitted exactly once.
            if self
                .rebalance_in_progress
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let previous_read = previous_read_ch.as_deref().unwrap_or(topology.read_ch());
                self.notifier
                    .data_rehashed(previous_read, topology.read_ch(), topology_id, false);
                if let Some(total_order) = self.mode.total_order_manager() {
                    total_order.state_transfer_end();
                }
            }
        }

        let _ = self.transaction_data_tx.send(topology_id);
        if self.rebalance_in_progress.load(Ordering::SeqCst) {
            self.waiting_for_state.store(true, Ordering::SeqCst);
        }
        self.notify_end_of_rebalance_if_needed(topology_id);
        if let Some(table) = self.mode.transaction_table() {
            table.cleanup_stale_transactions(&topology);
        }
        result
    }

    async fn handle_segment_changes(
        &self,
        topology: &CacheTopology,
        previous_write_ch: Option<Arc<ConsistentHash>>,
        previous_read_ch: Option<Arc<ConsistentHash>>,
        is_member: bool,
    ) -> Result<()> {
        if !(self.mode.is_transactional() || self.fetch_enabled.load(Ordering::SeqCst)) {
            return Ok(());
        }

        let new_write_ch = topology.write_ch();
        let added = match previous_write_ch {
            None => {
                // fresh start: pull everything we own under the new write
                // assignment, and pick up cluster listeners from a peer
                let added = self.owned_segments(new_write_ch);
                self.retrieve_cluster_listeners(topology).await;
                debug!(?added, "First topology, requesting all owned segments");
                added
            }
            Some(previous_write) => {
                let previous_segments = self.owned_segments(&previous_write);
                let new_segments = self.owned_segments(new_write_ch);

                let removed: HashSet<SegmentId> = previous_segments
                    .difference(&new_segments)
                    .copied()
                    .collect();
                let mut added: HashSet<SegmentId> = new_segments
                    .difference(&previous_segments)
                    .copied()
                    .collect();
                debug!(?removed, ?added, "Computed segment delta");

                self.cancel_transfers(&removed).await;
                if is_member {
                    // data for segments we no longer own is dropped, or moved
                    // to L1 when enabled
                    self.invalidate_segments(
                        &new_segments,
                        &removed,
                        new_write_ch,
                        previous_read_ch.as_deref(),
                    )
                    .await;
                }
                self.restart_broken_transfers(topology, &mut added);
                added
            }
        };

        if !added.is_empty() {
            self.add_transfers(topology, added).await;
        }
        Ok(())
    }

    /// Segments this node owns under `ch`, or none if it is not a member.
    fn owned_segments(&self, ch: &ConsistentHash) -> HashSet<SegmentId> {
        ch.segments_for_owner(self.local_node)
    }

    fn notify_end_of_rebalance_if_needed(&self, topology_id: TopologyId) {
        if self.waiting_for_state.load(Ordering::SeqCst) && !self.has_active_transfers() {
            if self
                .waiting_for_state
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!(topology_id, "Finished receiving all requested segments");
                self.stop_applying_state();
                self.notifier.rebalance_complete(topology_id);
            }
        }
    }

    // ---- adding transfers ------------------------------------------------

    async fn add_transfers(&self, topology: &CacheTopology, segments: HashSet<SegmentId>) {
        debug!(?segments, "Adding inbound state transfers");

        // the sources and segments we are going to get from each source
        let mut sources: HashMap<NodeId, HashSet<SegmentId>> = HashMap::new();

        if self.mode.is_transactional() && !self.mode.is_total_order() {
            self.request_transactions(topology, &segments, &mut sources)
                .await;
        }

        if self.fetch_enabled.load(Ordering::SeqCst) {
            self.request_segments(topology, &segments, &mut sources).await;
        }

        debug!(?segments, "Finished adding inbound state transfers");
    }

    async fn request_segments(
        &self,
        topology: &CacheTopology,
        segments: &HashSet<SegmentId>,
        sources: &mut HashMap<NodeId, HashSet<SegmentId>>,
    ) {
        if sources.is_empty() {
            self.find_sources(topology, segments, sources);
        }
        {
            let mut registry = self.registry.lock();
            for (source, segs) in sources.drain() {
                registry.add_transfer(source, segs, topology.topology_id());
            }
        }
        self.transfer_notify.notify_one();
    }

    // ---- source selection ------------------------------------------------

    fn find_sources(
        &self,
        topology: &CacheTopology,
        segments: &HashSet<SegmentId>,
        sources: &mut HashMap<NodeId, HashSet<SegmentId>>,
    ) {
        let excluded = self.excluded_sources.lock();
        for &segment in segments {
            // segments with no eligible owner are considered empty (or lost)
            // and do not need a transfer
            if let Some(source) =
                Self::select_source(topology.read_ch(), self.local_node, segment, &excluded)
            {
                sources.entry(source).or_default().insert(segment);
            }
        }
    }

    /// Choose the owner to pull a segment from.
    ///
    /// Iterates the owner list back to front, preferring owners added by
    /// newer topologies; never returns the local node or an excluded source.
    fn select_source(
        read_ch: &ConsistentHash,
        local_node: NodeId,
        segment: SegmentId,
        excluded: &HashSet<NodeId>,
    ) -> Option<NodeId> {
        let owners = read_ch.owners(segment);
        if owners.contains(&local_node) {
            return None;
        }
        for &owner in owners.iter().rev() {
            if owner != local_node && !excluded.contains(&owner) {
                return Some(owner);
            }
        }
        warn!(
            segment,
            ?owners,
            ?excluded,
            "No live owners found for segment; assuming it is empty"
        );
        None
    }

    // ---- transaction fetching --------------------------------------------

    /// Fetch and apply prepared remote transactions for the segments we are
    /// about to own, before any entry data is pulled.
    async fn request_transactions(
        &self,
        topology: &CacheTopology,
        segments: &HashSet<SegmentId>,
        sources: &mut HashMap<NodeId, HashSet<SegmentId>>,
    ) {
        self.find_sources(topology, segments, sources);
        let topology_id = topology.topology_id();

        let mut seen_failures = false;
        loop {
            let mut failed_segments: HashSet<SegmentId> = HashSet::new();
            let assignment: Vec<(NodeId, HashSet<SegmentId>)> = sources
                .iter()
                .map(|(source, segs)| (*source, segs.clone()))
                .collect();

            for (source, segs) in assignment {
                match self.get_transactions(source, &segs, topology_id).await {
                    Ok(transactions) => self.apply_transactions(source, transactions, topology_id),
                    Err(e) => {
                        warn!(
                            source,
                            segments = ?segs,
                            error = %e,
                            "Failed to retrieve transactions; will retry from another source"
                        );
                        self.excluded_sources.lock().insert(source);
                        failed_segments.extend(segs);
                    }
                }
            }

            if failed_segments.is_empty() {
                break;
            }
            seen_failures = true;
            sources.clear();
            self.find_sources(topology, &failed_segments, sources);
        }

        if seen_failures {
            // start source selection fresh when the data fetch begins
            sources.clear();
        }
    }

    async fn get_transactions(
        &self,
        source: NodeId,
        segments: &HashSet<SegmentId>,
        topology_id: TopologyId,
    ) -> Result<Vec<TransactionInfo>> {
        trace!(source, ?segments, "Requesting prepared transactions");
        let mut segment_list: Vec<SegmentId> = segments.iter().copied().collect();
        segment_list.sort_unstable();

        let request = StateRequest::GetTransactions {
            origin: self.local_node,
            topology_id,
            segments: segment_list,
        };
        match self.invoke_with_timeout(source, request).await? {
            StateResponse::Transactions(transactions) => Ok(transactions),
            other => Err(Error::Internal(format!(
                "unexpected response to transaction request: {:?}",
                other
            ))),
        }
    }

    fn apply_transactions(
        &self,
        sender: NodeId,
        transactions: Vec<TransactionInfo>,
        topology_id: TopologyId,
    ) {
        if transactions.is_empty() {
            return;
        }
        let Some(table) = self.mode.transaction_table() else {
            return;
        };
        debug!(sender, count = transactions.len(), "Applying transferred transactions");

        for info in transactions {
            let TransactionInfo {
                global_tx,
                modifications,
                locked_keys,
            } = info;
            let tx = table.get_or_create_remote_transaction(global_tx, modifications);
            // Force this node to replay the transaction data by making it
            // think it is one topology behind.
            tx.set_lookup_topology_id(topology_id.saturating_sub(1));
            for key in locked_keys {
                tx.add_backup_lock(key);
            }
        }
    }

    // ---- cluster listeners -----------------------------------------------

    /// Best-effort retrieval of cluster-listener registrations from another
    /// member on a fresh join. Failures are logged and state transfer
    /// continues without them.
    async fn retrieve_cluster_listeners(&self, topology: &CacheTopology) {
        for &source in topology.members() {
            if source == self.local_node {
                continue;
            }
            trace!(source, "Requesting cluster listeners");
            let request = StateRequest::GetCacheListeners {
                origin: self.local_node,
            };
            match self.invoke_with_timeout(source, request).await {
                Ok(StateResponse::CacheListeners(listeners)) => {
                    for listener in listeners {
                        if let Err(e) = self.notifier.register_cluster_listener(&listener) {
                            warn!(listener = %listener.id, error = %e, "Failed to install cluster listener");
                        }
                    }
                    return;
                }
                Ok(_) => warn!(source, "Unexpected response to cluster listener request"),
                Err(e) => warn!(source, error = %e, "Failed to retrieve cluster listeners"),
            }
        }
        trace!("No cluster listeners obtained from other members, assuming none are present");
    }

    // ---- cancellation and repair -----------------------------------------

    /// Cancel in-flight transfers for segments this node no longer owns.
    async fn cancel_transfers(&self, removed: &HashSet<SegmentId>) {
        let actions = self.registry.lock().cancel_transfers(removed);
        for action in actions {
            self.send_cancel(action).await;
        }
    }

    async fn send_cancel(&self, action: CancelAction) {
        debug!(
            source = action.source,
            segments = ?action.segments,
            "Cancelling inbound transfer"
        );
        let request = StateRequest::CancelTransfer {
            origin: self.local_node,
            topology_id: action.topology_id,
            segments: action.segments,
        };
        if let Err(e) = self.invoke_with_timeout(action.source, request).await {
            // the source may already be gone; nothing left to cancel there
            debug!(source = action.source, error = %e, "Cancel request failed");
        }
    }

    /// Restart transfers whose source dropped out of the new topology.
    ///
    /// Their unfinished segments join `added_segments` so they are
    /// re-requested from a live owner, unless another source is already
    /// delivering them.
    fn restart_broken_transfers(
        &self,
        topology: &CacheTopology,
        added_segments: &mut HashSet<SegmentId>,
    ) {
        let members: HashSet<NodeId> = topology.read_ch().members().iter().copied().collect();
        let mut registry = self.registry.lock();
        let restarted = registry.terminate_broken_sources(&members);
        added_segments.extend(restarted);
        added_segments.retain(|s| registry.task_for_segment(*s).is_none());
    }

    // ---- transfer pump ---------------------------------------------------

    async fn pump_loop(consumer: Weak<StateConsumer>) {
        loop {
            let Some(this) = consumer.upgrade() else {
                return;
            };
            if this.shutdown.is_cancelled() {
                return;
            }

            loop {
                // pop under a short-lived lock; the task runs without it
                let next = { this.registry.lock().pop_ready() };
                let Some(task_id) = next else { break };
                if this.shutdown.is_cancelled() {
                    return;
                }
                match this.process_transfer_task(task_id).await {
                    Ok(()) => {}
                    Err(Error::Interrupted) => return,
                    Err(e) => warn!(task = task_id, error = %e, "Inbound transfer task failed"),
                }
            }

            let notify = this.transfer_notify.clone();
            let shutdown = this.shutdown.clone();
            drop(this);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = notify.notified() => {}
            }
        }
    }

    /// Run one inbound task to completion: send the start request, wait for
    /// all its chunks, and re-queue its segments elsewhere on failure.
    async fn process_transfer_task(&self, task_id: TaskId) -> Result<()> {
        let (source, segments, topology_id, completion) = {
            let mut registry = self.registry.lock();
            let Some(task) = registry.task_mut(task_id) else {
                // cancelled while queued
                return Ok(());
            };
            if task.status().is_terminal() {
                return Ok(());
            }
            task.mark_running();
            (
                task.source(),
                task.sorted_segments(),
                task.topology_id(),
                task.completion_handle(),
            )
        };

        debug!(source, ?segments, topology_id, "Requesting segments");
        let request = StateRequest::StartTransfer {
            origin: self.local_node,
            topology_id,
            segments,
        };

        let status = match self.invoke_with_timeout(source, request).await {
            Ok(StateResponse::Ack) => match completion.wait(self.config.timeout).await {
                Ok(status) => status,
                Err(Error::Timeout) => {
                    warn!(source, task = task_id, "Timed out waiting for segments");
                    TaskStatus::Failed
                }
                Err(e) => return Err(e),
            },
            Ok(other) => {
                warn!(source, ?other, "Unexpected response to segment request");
                TaskStatus::Failed
            }
            Err(Error::Interrupted) => return Err(Error::Interrupted),
            Err(e) => {
                warn!(source, task = task_id, error = %e, "Failed to request segments");
                TaskStatus::Failed
            }
        };

        match status {
            TaskStatus::Completed => {
                trace!(task = task_id, "Inbound transfer finished successfully");
            }
            _ => self.retry_transfer_task(task_id),
        }
        Ok(())
    }

    /// Replace a failed task with new tasks pulling its still-needed
    /// segments from other sources. Remove and re-add happen under one
    /// registry lock acquisition.
    fn retry_transfer_task(&self, task_id: TaskId) {
        let Some(topology) = self.get_cache_topology() else {
            return;
        };
        trace!(task = task_id, "Retrying failed inbound transfer");

        let mut registry = self.registry.lock();
        let mut failed_segments: HashSet<SegmentId> = HashSet::new();
        if let Some(mut task) = registry.remove_transfer(task_id) {
            task.mark_failed();
            self.excluded_sources.lock().insert(task.source());
            failed_segments.extend(task.segments().iter().copied());
            self.counters.tasks_retried.fetch_add(1, Ordering::Relaxed);
        }

        // only re-request segments we still own and do not already have
        let owned_write = self.owned_segments(topology.write_ch());
        let owned_read = self.owned_segments(topology.read_ch());
        failed_segments.retain(|s| owned_write.contains(s) && !owned_read.contains(s));

        let excluded = self.excluded_sources.lock().clone();
        let mut sources: HashMap<NodeId, HashSet<SegmentId>> = HashMap::new();
        for &segment in &failed_segments {
            if let Some(source) =
                Self::select_source(topology.read_ch(), self.local_node, segment, &excluded)
            {
                sources.entry(source).or_default().insert(segment);
            }
        }
        for (source, segs) in sources {
            registry.add_transfer(source, segs, topology.topology_id());
        }
        drop(registry);
        self.transfer_notify.notify_one();
    }

    fn on_task_completion(&self, task_id: TaskId) {
        trace!(task = task_id, "Completion of inbound transfer task");
        let removed = self.registry.lock().remove_transfer(task_id);
        if removed.is_some() {
            self.counters.tasks_completed.fetch_add(1, Ordering::Relaxed);
        }
        let topology_id = self
            .get_cache_topology()
            .map(|t| t.topology_id())
            .unwrap_or_default();
        self.notify_end_of_rebalance_if_needed(topology_id);
    }

    // ---- state application -----------------------------------------------

    /// Apply entry chunks received from a remote owner.
    pub async fn apply_state(
        &self,
        sender: NodeId,
        topology_id: TopologyId,
        chunks: Vec<StateChunk>,
    ) {
        let Some(topology) = self.get_cache_topology() else {
            warn!(sender, "Ignoring received state before the first topology");
            return;
        };
        let write_ch = topology.write_ch().clone();
        // ignore state received after we are no longer a member
        if !write_ch.contains(self.local_node) {
            trace!(sender, "Ignoring received state because we are no longer a member");
            return;
        }

        debug!(
            sender,
            topology_id,
            chunks = chunks.len(),
            container_entries = self.data_container.len(),
            "Applying received state"
        );
        let local_segments = self.owned_segments(&write_ch);

        for chunk in chunks {
            // late messages may carry segments we no longer own
            if !local_segments.contains(&chunk.segment_id) {
                warn!(
                    sender,
                    segment = chunk.segment_id,
                    "Discarding received entries for a segment not owned by this node"
                );
                continue;
            }

            let Some(task_id) = self.registry.lock().task_for_segment(chunk.segment_id) else {
                warn!(sender, segment = chunk.segment_id, "Received unsolicited state");
                continue;
            };

            if !chunk.entries.is_empty() {
                self.do_apply_state(sender, chunk.segment_id, &chunk.entries)
                    .await;
            }

            let completed = {
                let mut registry = self.registry.lock();
                match registry.task_mut(task_id) {
                    Some(task) => {
                        task.on_state_received(chunk.segment_id, chunk.is_last_chunk);
                        task.status() == TaskStatus::Completed
                    }
                    None => false,
                }
            };
            self.counters.chunks_applied.fetch_add(1, Ordering::Relaxed);
            if completed {
                self.on_task_completion(task_id);
            }
        }

        trace!(
            container_entries = self.data_container.len(),
            "Finished applying received state"
        );
    }

    async fn do_apply_state(&self, sender: NodeId, segment_id: SegmentId, entries: &[CacheEntry]) {
        debug!(
            sender,
            segment_id,
            count = entries.len(),
            "Applying new state for segment"
        );
        let Some(updated_keys) = self.updated_keys.read().clone() else {
            // tracking stopped: state application is over, nothing may be
            // written anymore
            debug!(segment_id, "State application is stopped; discarding entries");
            return;
        };

        for entry in entries {
            if updated_keys.contains(&entry.key) {
                trace!(key = ?entry.key, "Key modified by a user write; not applying transferred value");
                self.counters.entries_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let command = WriteCommand::put_for_state_transfer(entry);
            let result = match self.mode.transaction_manager() {
                Some(manager) => self.apply_entry_in_tx(manager.as_ref(), command).await,
                None => {
                    self.invoker
                        .invoke(&InvocationContext::SingleKey, command)
                        .await
                }
            };
            match result {
                Ok(()) => {
                    self.counters.entries_applied.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(key = ?entry.key, error = %e, "Problem applying state for key");
                }
            }
        }
        debug!(segment_id, "Finished applying state for segment");
    }

    /// Apply one entry inside its own transaction: commit on success, roll
    /// back on failure.
    async fn apply_entry_in_tx(
        &self,
        manager: &dyn TransactionManager,
        command: WriteCommand,
    ) -> Result<()> {
        let tx = manager.begin().await?;
        let ctx = InvocationContext::Transactional(tx);
        match self.invoker.invoke(&ctx, command).await {
            Ok(()) => {
                if let Err(e) = manager.commit(tx).await {
                    error!(error = %e, "Could not commit transaction created by state transfer");
                    if manager.is_active(tx) {
                        manager.rollback(tx).await?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_error) = manager.rollback(tx).await {
                    error!(error = %rollback_error, "Rollback of state-transfer transaction failed");
                }
                Err(e)
            }
        }
    }

    // ---- segment invalidation --------------------------------------------

    /// Remove (or demote to L1) the entries of segments this node no longer
    /// owns, scanning both the data container and the persistent stores.
    async fn invalidate_segments(
        &self,
        new_segments: &HashSet<SegmentId>,
        segments_to_l1: &HashSet<SegmentId>,
        new_ch: &ConsistentHash,
        previous_ch: Option<&ConsistentHash>,
    ) {
        if let Some(listener) = self.key_invalidation_listener.read().clone() {
            listener.before_invalidation(new_segments, segments_to_l1);
        }

        let l1_on_rehash = self.config.l1_on_rehash;
        let mut keys_to_l1: Vec<Bytes> = Vec::new();
        let mut keys_to_remove: Vec<Bytes> = Vec::new();

        let container_keys = self.data_container.keys();
        for key in &container_keys {
            let segment = new_ch.segment_of(key);
            if segments_to_l1.contains(&segment) {
                keys_to_l1.push(key.clone());
            } else if !new_segments.contains(&segment) {
                keys_to_remove.push(key.clone());
            }

            // Previous owners that no longer own a key must become L1
            // requestors of it, so future invalidations reach them.
            if l1_on_rehash {
                if let Some(previous_ch) = previous_ch {
                    let owners = new_ch.owners(segment);
                    if owners.contains(&self.local_node) {
                        for &previous_owner in previous_ch.owners(segment) {
                            if !owners.contains(&previous_owner) {
                                trace!(
                                    ?key,
                                    previous_owner,
                                    "Adding previous owner to L1 requestors"
                                );
                                self.l1_manager.add_requestor(key, previous_owner);
                            }
                        }
                    }
                }
            }
        }

        // keys only present in the persistent stores
        let exclude: HashSet<Bytes> = container_keys.into_iter().collect();
        match self.persistence.stored_keys(&exclude).await {
            Ok(stored) => {
                for key in stored {
                    let segment = new_ch.segment_of(&key);
                    if segments_to_l1.contains(&segment) {
                        keys_to_l1.push(key);
                    } else if !new_segments.contains(&segment) {
                        keys_to_remove.push(key);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to enumerate stored keys; invalidating in-memory state only");
            }
        }

        if l1_on_rehash {
            debug!(segments = ?segments_to_l1, "Moving state to L1 for removed segments");
        } else {
            debug!(segments = ?segments_to_l1, "Removing state for removed segments");
        }

        if !keys_to_l1.is_empty() {
            let count = keys_to_l1.len();
            let command = WriteCommand::InvalidateL1 {
                keys: keys_to_l1,
                flags: WriteFlags::invalidation(),
            };
            match self.invoker.invoke(&InvocationContext::NonTx, command).await {
                Ok(()) => debug!(count, "Invalidated L1 keys"),
                Err(e) => error!(error = %e, "Failed to invalidate L1 keys"),
            }
        }

        if !keys_to_remove.is_empty() {
            let count = keys_to_remove.len();
            let command = WriteCommand::Invalidate {
                keys: keys_to_remove,
                flags: WriteFlags::invalidation(),
            };
            match self.invoker.invoke(&InvocationContext::NonTx, command).await {
                Ok(()) => debug!(count, "Invalidated keys no longer owned"),
                Err(e) => error!(error = %e, "Failed to invalidate keys"),
            }
        }
    }

    // ---- updated-keys tracking -------------------------------------------

    /// Stop applying incoming state and stop tracking updated keys. Called
    /// when state transfer ends or when the cache is cleared mid-transfer.
    pub fn stop_applying_state(&self) {
        trace!("Stop keeping track of changed keys for state transfer");
        *self.updated_keys.write() = None;
    }

    /// Record a key modified by user code, right before it is committed to
    /// the data container. Only keys this node owns under the write
    /// assignment are tracked.
    pub fn add_updated_key(&self, key: Bytes) {
        let Some(updated_keys) = self.updated_keys.read().clone() else {
            return;
        };
        let Some(topology) = self.get_cache_topology() else {
            return;
        };
        if topology.write_ch().is_key_local(self.local_node, &key) {
            trace!(?key, "Key modified by a user write; state transfer will ignore it");
            updated_keys.insert(key);
        }
    }

    /// Whether a key was updated by user code during state transfer, making
    /// it untouchable by state transfer.
    ///
    /// Returns `true` when tracking is inactive: with state application
    /// stopped no transferred value may be committed at all.
    pub fn is_key_updated(&self, key: &[u8]) -> bool {
        match self.updated_keys.read().clone() {
            None => true,
            Some(updated_keys) => updated_keys.contains(key),
        }
    }

    /// Run `f` iff the key was not updated by user code, atomically with
    /// respect to concurrent updates of the same key. Returns whether `f`
    /// ran; always `false` once tracking stopped.
    pub fn execute_if_key_is_not_updated(&self, key: &Bytes, f: impl FnOnce()) -> bool {
        match self.updated_keys.read().clone() {
            None => false,
            Some(updated_keys) => updated_keys.run_if_absent(key, f),
        }
    }

    // ---- accessors -------------------------------------------------------

    /// Whether a rebalance is in progress.
    pub fn is_state_transfer_in_progress(&self) -> bool {
        self.rebalance_in_progress.load(Ordering::SeqCst)
    }

    /// Whether `key` is currently being transferred to this node: it will be
    /// local under the pending ownership but is not local under the current
    /// one.
    pub fn is_state_transfer_in_progress_for_key(&self, key: &[u8]) -> bool {
        if self.mode.is_invalidation() {
            // In invalidation mode entries can disappear at any time, so a
            // missing value during transfer needs no special handling.
            return false;
        }
        let Some(topology) = self.get_cache_topology() else {
            return false;
        };
        let Some(pending_ch) = topology.pending_ch() else {
            return false;
        };
        pending_ch.is_key_local(self.local_node, key)
            && !topology.read_ch().is_key_local(self.local_node, key)
    }

    /// Whether this node holds data for the cache.
    pub fn owns_data(&self) -> bool {
        self.owns_data.load(Ordering::SeqCst)
    }

    /// The current topology snapshot.
    pub fn get_cache_topology(&self) -> Option<CacheTopology> {
        self.topology.read().clone()
    }

    /// Whether any inbound transfer is still in flight.
    pub fn has_active_transfers(&self) -> bool {
        self.registry.lock().has_active()
    }

    /// Wait until a topology with id at least `topology_id` is installed.
    pub async fn wait_for_topology(&self, topology_id: TopologyId) -> Result<()> {
        let mut rx = self.topology_installed_rx.clone();
        while *rx.borrow_and_update() < topology_id {
            rx.changed().await.map_err(|_| Error::Interrupted)?;
        }
        Ok(())
    }

    /// Wait until transaction data for a topology with id at least
    /// `topology_id` has been received.
    pub async fn wait_for_transaction_data(&self, topology_id: TopologyId) -> Result<()> {
        let mut rx = self.transaction_data_rx.clone();
        while *rx.borrow_and_update() < topology_id {
            rx.changed().await.map_err(|_| Error::Interrupted)?;
        }
        Ok(())
    }

    /// Counters describing the work done so far.
    pub fn stats(&self) -> StateTransferStats {
        self.counters.snapshot()
    }

    /// Install an observer invoked right before segment invalidation runs.
    pub fn set_key_invalidation_listener(&self, listener: Arc<dyn KeyInvalidationListener>) {
        *self.key_invalidation_listener.write() = Some(listener);
    }

    // ---- rpc helper ------------------------------------------------------

    async fn invoke_with_timeout(
        &self,
        target: NodeId,
        request: StateRequest,
    ) -> Result<StateResponse> {
        match tokio::time::timeout(self.config.timeout, self.rpc.invoke(target, request)).await {
            Err(_) => Err(Error::Timeout),
            Ok(result) => result,
        }
    }
}

/// Builder for [`StateConsumer`].
pub struct StateConsumerBuilder {
    local_node: NodeId,
    config: StateTransferConfig,
    mode: CacheMode,
    rpc: Option<Arc<dyn RpcManager>>,
    invoker: Option<Arc<dyn CommandInvoker>>,
    data_container: Option<Arc<dyn DataContainer>>,
    persistence: Arc<dyn PersistenceManager>,
    notifier: Option<Arc<dyn CacheNotifier>>,
    l1_manager: Arc<dyn L1Manager>,
}

impl StateConsumerBuilder {
    fn new(local_node: NodeId, config: StateTransferConfig, mode: CacheMode) -> Self {
        Self {
            local_node,
            config,
            mode,
            rpc: None,
            invoker: None,
            data_container: None,
            persistence: Arc::new(crate::container::NoStores),
            notifier: None,
            l1_manager: Arc::new(crate::events::NoL1),
        }
    }

    /// Set the RPC transport. Required.
    pub fn rpc(mut self, rpc: Arc<dyn RpcManager>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Set the interceptor-chain seam. Required.
    pub fn invoker(mut self, invoker: Arc<dyn CommandInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Set the data container. Required.
    pub fn data_container(mut self, container: Arc<dyn DataContainer>) -> Self {
        self.data_container = Some(container);
        self
    }

    /// Set the persistence manager. Defaults to no stores.
    pub fn persistence(mut self, persistence: Arc<dyn PersistenceManager>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Set the cache notifier. Required.
    pub fn notifier(mut self, notifier: Arc<dyn CacheNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the L1 manager. Defaults to no L1.
    pub fn l1_manager(mut self, l1_manager: Arc<dyn L1Manager>) -> Self {
        self.l1_manager = l1_manager;
        self
    }

    /// Build the consumer.
    pub fn build(self) -> Result<Arc<StateConsumer>> {
        self.config.validate()?;
        let rpc = self
            .rpc
            .ok_or_else(|| Error::Config("rpc manager is required".into()))?;
        let invoker = self
            .invoker
            .ok_or_else(|| Error::Config("command invoker is required".into()))?;
        let data_container = self
            .data_container
            .ok_or_else(|| Error::Config("data container is required".into()))?;
        let notifier = self
            .notifier
            .ok_or_else(|| Error::Config("cache notifier is required".into()))?;

        let (topology_installed_tx, topology_installed_rx) = watch::channel(0);
        let (transaction_data_tx, transaction_data_rx) = watch::channel(0);

        Ok(Arc::new_cyclic(|weak| StateConsumer {
            local_node: self.local_node,
            config: self.config,
            mode: self.mode,
            weak_self: weak.clone(),
            rpc,
            invoker,
            data_container,
            persistence: self.persistence,
            notifier,
            l1_manager: self.l1_manager,
            topology: RwLock::new(None),
            updated_keys: RwLock::new(None),
            registry: Mutex::new(TransferRegistry::new()),
            excluded_sources: Mutex::new(HashSet::new()),
            rebalance_in_progress: AtomicBool::new(false),
            waiting_for_state: AtomicBool::new(false),
            owns_data: AtomicBool::new(false),
            fetch_enabled: AtomicBool::new(false),
            pump_started: AtomicBool::new(false),
            transfer_notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            topology_installed_tx,
            topology_installed_rx,
            transaction_data_tx,
            transaction_data_rx,
            key_invalidation_listener: RwLock::new(None),
            counters: Counters::default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_ch(owners: Vec<Vec<NodeId>>) -> ConsistentHash {
        let mut members: Vec<NodeId> = owners.iter().flatten().copied().collect();
        members.sort_unstable();
        members.dedup();
        ConsistentHash::from_owners(members, owners).unwrap()
    }

    #[test]
    fn select_source_prefers_the_newest_owner() {
        let ch = read_ch(vec![vec![1, 2, 3]]);
        let excluded = HashSet::new();
        // owner list is ordered oldest first; 3 joined last
        assert_eq!(StateConsumer::select_source(&ch, 4, 0, &excluded), Some(3));
    }

    #[test]
    fn select_source_skips_excluded_sources() {
        let ch = read_ch(vec![vec![1, 2, 3]]);
        let excluded: HashSet<NodeId> = [3].into_iter().collect();
        assert_eq!(StateConsumer::select_source(&ch, 4, 0, &excluded), Some(2));
    }

    #[test]
    fn select_source_never_returns_self() {
        let ch = read_ch(vec![vec![1, 2]]);
        let excluded: HashSet<NodeId> = [1].into_iter().collect();
        // node 2 asks for segment 0: the only non-excluded owner is itself's
        // peer 1, which is excluded
        assert_eq!(StateConsumer::select_source(&ch, 2, 0, &excluded), None);
    }

    #[test]
    fn select_source_yields_nothing_when_already_an_owner() {
        let ch = read_ch(vec![vec![1, 2]]);
        let excluded = HashSet::new();
        assert_eq!(StateConsumer::select_source(&ch, 1, 0, &excluded), None);
    }

    #[test]
    fn cache_mode_helpers() {
        assert!(!CacheMode::NonTx.is_transactional());
        assert!(!CacheMode::NonTx.is_total_order());
        assert!(CacheMode::Invalidation.is_invalidation());
        assert!(CacheMode::NonTx.transaction_manager().is_none());
        assert!(CacheMode::NonTx.total_order_manager().is_none());
    }
}
