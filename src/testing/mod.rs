//! Testing utilities for state transfer.
//!
//! Provides mock collaborators and a small in-process harness: scripted
//! source nodes stream chunks into a consumer through a loopback RPC
//! implementation, a recording notifier captures rehash events, and a
//! container-backed invoker models the interceptor chain (including the
//! user-write-wins check).

mod state_transfer_e2e_tests;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::commands::{
    ClusterListenerSpec, CommandInvoker, InvocationContext, RpcManager, StateChunk, StateRequest,
    StateResponse, WriteCommand,
};
use crate::config::StateTransferConfig;
use crate::container::{MapDataContainer, PersistenceManager};
use crate::error::{Error, Result};
use crate::events::{CacheNotifier, L1Manager};
use crate::statetransfer::{CacheMode, StateConsumer};
use crate::topology::{CacheTopology, ConsistentHash};
use crate::txn::{
    total_order_latch, GlobalTransactionId, RemoteTransaction, TotalOrderLatch,
    TotalOrderLatchHandle, TotalOrderManager, TransactionHandle, TransactionInfo,
    TransactionManager, TransactionTable,
};
use crate::types::{CacheEntry, NodeId, SegmentId, TopologyId};

/// Poll a condition until it holds or the timeout expires.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Find a key that hashes into the wanted segment.
pub fn key_in_segment(segment: SegmentId, num_segments: u32, tag: &str) -> Bytes {
    let probe = ConsistentHash::new(num_segments, 1, vec![1]);
    for i in 0..10_000u32 {
        let candidate = Bytes::from(format!("{}-{}", tag, i));
        if probe.segment_of(&candidate) == segment {
            return candidate;
        }
    }
    panic!("no key found for segment {}", segment);
}

/// Build a topology from explicit owner tables.
pub fn topology(
    topology_id: TopologyId,
    members: Vec<NodeId>,
    current_owners: Vec<Vec<NodeId>>,
    pending_owners: Option<Vec<Vec<NodeId>>>,
) -> CacheTopology {
    let current = Arc::new(ConsistentHash::from_owners(members.clone(), current_owners).unwrap());
    let pending = pending_owners
        .map(|owners| Arc::new(ConsistentHash::from_owners(members.clone(), owners).unwrap()));
    CacheTopology::new(topology_id, members, current, pending)
}

/// Notifier that records every event it sees.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    /// `(topology_id, is_pre)` pairs, in emission order.
    pub rehash_events: Mutex<Vec<(TopologyId, bool)>>,
    /// Topology ids for which the rebalance completed.
    pub completions: Mutex<Vec<TopologyId>>,
    /// Cluster listeners installed.
    pub listeners: Mutex<Vec<ClusterListenerSpec>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of terminal (post) rehash notifications seen.
    pub fn post_rehash_count(&self) -> usize {
        self.rehash_events
            .lock()
            .iter()
            .filter(|(_, pre)| !pre)
            .count()
    }

    pub fn completion_count(&self) -> usize {
        self.completions.lock().len()
    }
}

impl CacheNotifier for RecordingNotifier {
    fn data_rehashed(
        &self,
        _read_ch: &ConsistentHash,
        _write_ch: &ConsistentHash,
        topology_id: TopologyId,
        is_pre: bool,
    ) {
        self.rehash_events.lock().push((topology_id, is_pre));
    }

    fn rebalance_complete(&self, topology_id: TopologyId) {
        self.completions.lock().push(topology_id);
    }

    fn register_cluster_listener(&self, listener: &ClusterListenerSpec) -> Result<()> {
        self.listeners.lock().push(listener.clone());
        Ok(())
    }
}

/// L1 manager that records requestor registrations.
#[derive(Debug, Default)]
pub struct RecordingL1Manager {
    pub requestors: Mutex<Vec<(Bytes, NodeId)>>,
}

impl RecordingL1Manager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl L1Manager for RecordingL1Manager {
    fn add_requestor(&self, key: &Bytes, node: NodeId) {
        self.requestors.lock().push((key.clone(), node));
    }
}

/// Persistence manager backed by a scripted key list.
#[derive(Debug, Default)]
pub struct MapPersistence {
    pub keys: Mutex<Vec<Bytes>>,
    pub fail: AtomicBool,
}

impl MapPersistence {
    pub fn new(keys: Vec<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(keys),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PersistenceManager for MapPersistence {
    async fn stored_keys(&self, exclude: &HashSet<Bytes>) -> Result<Vec<Bytes>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Internal("store enumeration failed".into()));
        }
        Ok(self
            .keys
            .lock()
            .iter()
            .filter(|k| !exclude.contains(*k))
            .cloned()
            .collect())
    }
}

/// Interceptor-chain stand-in writing into a [`MapDataContainer`].
///
/// User writes (no state-transfer flag) invoke the consumer's pre-commit
/// hook; state-transfer puts consult the updated-keys predicate before
/// committing, so user writes win.
#[derive(Debug)]
pub struct ContainerInvoker {
    container: Arc<MapDataContainer>,
    consumer: RwLock<Option<Weak<StateConsumer>>>,
    /// Keys passed to invalidate commands, for assertions.
    pub invalidated: Mutex<Vec<Bytes>>,
}

impl ContainerInvoker {
    pub fn new(container: Arc<MapDataContainer>) -> Arc<Self> {
        Arc::new(Self {
            container,
            consumer: RwLock::new(None),
            invalidated: Mutex::new(Vec::new()),
        })
    }

    /// Wire the invoker to its consumer for the user-write-wins checks.
    pub fn connect(&self, consumer: &Arc<StateConsumer>) {
        *self.consumer.write() = Some(Arc::downgrade(consumer));
    }

    fn consumer(&self) -> Option<Arc<StateConsumer>> {
        self.consumer.read().as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl CommandInvoker for ContainerInvoker {
    async fn invoke(&self, _ctx: &InvocationContext, command: WriteCommand) -> Result<()> {
        match command {
            WriteCommand::Put {
                key,
                value,
                expires_at_nanos,
                flags,
            } => {
                if flags.put_for_state_transfer {
                    if let Some(consumer) = self.consumer() {
                        if consumer.is_key_updated(&key) {
                            return Ok(());
                        }
                    }
                } else if let Some(consumer) = self.consumer() {
                    // pre-commit hook of the user write path
                    consumer.add_updated_key(key.clone());
                }
                self.container.insert(CacheEntry {
                    key,
                    value,
                    expires_at_nanos,
                });
            }
            WriteCommand::Invalidate { keys, .. } | WriteCommand::InvalidateL1 { keys, .. } => {
                let mut log = self.invalidated.lock();
                for key in keys {
                    self.container.remove(&key);
                    log.push(key);
                }
            }
        }
        Ok(())
    }
}

/// A scripted remote owner the harness serves state from.
#[derive(Debug, Default)]
pub struct SourceNode {
    /// Entries this source would stream.
    pub container: Arc<MapDataContainer>,
    /// Prepared transactions returned to `GetTransactions`.
    pub transactions: Mutex<Vec<TransactionInfo>>,
    /// Cluster listeners returned to `GetCacheListeners`.
    pub listeners: Mutex<Vec<ClusterListenerSpec>>,
    /// Fail every request sent to this node.
    pub unreachable: AtomicBool,
    /// Fail only transaction requests.
    pub fail_transactions: AtomicBool,
    /// Acknowledge start requests but stream nothing.
    pub paused: AtomicBool,
    /// Stream entries but never the end-of-segment marker.
    pub hold_last_chunk: AtomicBool,
}

impl SourceNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_entries(entries: Vec<CacheEntry>) -> Arc<Self> {
        let node = Self::new();
        for entry in entries {
            node.container.insert(entry);
        }
        node
    }
}

/// Loopback RPC: routes requests to scripted [`SourceNode`]s and streams
/// their chunks back into the connected consumer, the way the outgoing
/// provider of a real peer would.
#[derive(Debug)]
pub struct ClusterRpc {
    num_segments: u32,
    nodes: Mutex<HashMap<NodeId, Arc<SourceNode>>>,
    consumer: RwLock<Option<Weak<StateConsumer>>>,
    /// `(target, request kind)` log for assertions.
    pub requests: Mutex<Vec<(NodeId, &'static str)>>,
}

impl ClusterRpc {
    pub fn new(num_segments: u32) -> Arc<Self> {
        Arc::new(Self {
            num_segments,
            nodes: Mutex::new(HashMap::new()),
            consumer: RwLock::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Register a scripted source node.
    pub fn add_node(&self, id: NodeId, node: Arc<SourceNode>) {
        self.nodes.lock().insert(id, node);
    }

    /// Wire the RPC loopback to the consumer chunks are delivered to.
    pub fn connect(&self, consumer: &Arc<StateConsumer>) {
        *self.consumer.write() = Some(Arc::downgrade(consumer));
    }

    /// Targets of all recorded requests of one kind, in order.
    pub fn requests_of_kind(&self, kind: &str) -> Vec<NodeId> {
        self.requests
            .lock()
            .iter()
            .filter(|(_, k)| *k == kind)
            .map(|(target, _)| *target)
            .collect()
    }

    fn consumer(&self) -> Option<Arc<StateConsumer>> {
        self.consumer.read().as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl RpcManager for ClusterRpc {
    async fn invoke(&self, target: NodeId, request: StateRequest) -> Result<StateResponse> {
        self.requests.lock().push((target, request.kind()));

        let node = self
            .nodes
            .lock()
            .get(&target)
            .cloned()
            .ok_or_else(|| Error::transport(target, "unknown member"))?;
        if node.unreachable.load(Ordering::SeqCst) {
            return Err(Error::transport(target, "node unreachable"));
        }

        match request {
            StateRequest::GetTransactions { .. } => {
                if node.fail_transactions.load(Ordering::SeqCst) {
                    return Err(Error::transport(target, "transaction request failed"));
                }
                Ok(StateResponse::Transactions(node.transactions.lock().clone()))
            }
            StateRequest::GetCacheListeners { .. } => {
                Ok(StateResponse::CacheListeners(node.listeners.lock().clone()))
            }
            StateRequest::StartTransfer {
                topology_id,
                segments,
                ..
            } => {
                if !node.paused.load(Ordering::SeqCst) {
                    let consumer = self
                        .consumer()
                        .ok_or_else(|| Error::Internal("no consumer connected".into()))?;
                    let hold_last = node.hold_last_chunk.load(Ordering::SeqCst);
                    let probe = ConsistentHash::new(self.num_segments, 1, vec![target]);

                    let mut by_segment: HashMap<SegmentId, Vec<CacheEntry>> = HashMap::new();
                    for entry in node.container.entries() {
                        by_segment
                            .entry(probe.segment_of(&entry.key))
                            .or_default()
                            .push(entry);
                    }

                    tokio::spawn(async move {
                        for segment in segments {
                            let entries = by_segment.remove(&segment).unwrap_or_default();
                            let chunk = StateChunk::new(segment, entries, !hold_last);
                            consumer.apply_state(target, topology_id, vec![chunk]).await;
                        }
                    });
                }
                Ok(StateResponse::Ack)
            }
            StateRequest::CancelTransfer { .. } => Ok(StateResponse::Ack),
        }
    }
}

/// Transaction manager handing out sequential handles.
#[derive(Debug, Default)]
pub struct TestTransactionManager {
    next: AtomicU64,
    active: Mutex<HashSet<u64>>,
}

impl TestTransactionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TransactionManager for TestTransactionManager {
    async fn begin(&self) -> Result<TransactionHandle> {
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.lock().insert(id);
        Ok(TransactionHandle(id))
    }

    async fn commit(&self, tx: TransactionHandle) -> Result<()> {
        self.active.lock().remove(&tx.0);
        Ok(())
    }

    async fn rollback(&self, tx: TransactionHandle) -> Result<()> {
        self.active.lock().remove(&tx.0);
        Ok(())
    }

    fn is_active(&self, tx: TransactionHandle) -> bool {
        self.active.lock().contains(&tx.0)
    }
}

/// Transaction table keeping remote transactions in a map.
#[derive(Debug, Default)]
pub struct TestTransactionTable {
    remote: Mutex<HashMap<GlobalTransactionId, Arc<RemoteTransaction>>>,
    /// Topology ids `cleanup_stale_transactions` was called with.
    pub cleanups: Mutex<Vec<TopologyId>>,
}

impl TestTransactionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn remote_transaction(&self, gtx: &GlobalTransactionId) -> Option<Arc<RemoteTransaction>> {
        self.remote.lock().get(gtx).cloned()
    }
}

impl TransactionTable for TestTransactionTable {
    fn get_or_create_remote_transaction(
        &self,
        global_tx: GlobalTransactionId,
        modifications: Vec<WriteCommand>,
    ) -> Arc<RemoteTransaction> {
        self.remote
            .lock()
            .entry(global_tx)
            .or_insert_with(|| Arc::new(RemoteTransaction::new(global_tx, modifications)))
            .clone()
    }

    fn cleanup_stale_transactions(&self, topology: &CacheTopology) {
        self.cleanups.lock().push(topology.topology_id());
    }
}

/// Total-order manager handing out pre-registered latches.
#[derive(Debug, Default)]
pub struct TestTotalOrderManager {
    latches: Mutex<Vec<TotalOrderLatch>>,
    /// Topology ids state transfer started for.
    pub started: Mutex<Vec<TopologyId>>,
    /// Whether the end-of-rebalance notification arrived.
    pub ended: AtomicBool,
}

impl TestTotalOrderManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a latch the next state-transfer start must wait on.
    pub fn add_latch(&self) -> TotalOrderLatchHandle {
        let (handle, latch) = total_order_latch();
        self.latches.lock().push(latch);
        handle
    }
}

impl TotalOrderManager for TestTotalOrderManager {
    fn state_transfer_start(&self, topology_id: TopologyId) -> Vec<TotalOrderLatch> {
        self.started.lock().push(topology_id);
        std::mem::take(&mut *self.latches.lock())
    }

    fn state_transfer_end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

/// A consumer wired to the standard set of mocks.
pub struct TestNode {
    pub id: NodeId,
    pub container: Arc<MapDataContainer>,
    pub invoker: Arc<ContainerInvoker>,
    pub rpc: Arc<ClusterRpc>,
    pub notifier: Arc<RecordingNotifier>,
    pub consumer: Arc<StateConsumer>,
}

impl TestNode {
    /// Build a started consumer around the given RPC loopback.
    pub fn build(
        id: NodeId,
        config: StateTransferConfig,
        mode: CacheMode,
        rpc: Arc<ClusterRpc>,
    ) -> TestNode {
        let container = Arc::new(MapDataContainer::new());
        let invoker = ContainerInvoker::new(container.clone());
        let notifier = RecordingNotifier::new();

        let consumer = StateConsumer::builder(id, config, mode)
            .rpc(rpc.clone())
            .invoker(invoker.clone())
            .data_container(container.clone())
            .notifier(notifier.clone())
            .build()
            .expect("consumer builds");

        invoker.connect(&consumer);
        rpc.connect(&consumer);
        consumer.start();

        TestNode {
            id,
            container,
            invoker,
            rpc,
            notifier,
            consumer,
        }
    }

    /// Keys currently held, sorted for stable assertions.
    pub fn keys(&self) -> Vec<Bytes> {
        let mut keys = self
            .container
            .entries()
            .into_iter()
            .map(|e| e.key)
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }
}
