//! Transaction collaborators for transactional caches.
//!
//! State transfer interacts with transactions in two ways: it replays
//! prepared-but-uncommitted remote transactions fetched from previous owners,
//! and it wraps each applied entry in a short-lived local transaction when
//! the cache is transactional. The heavy lifting lives outside this crate;
//! only the contracts the consumer needs are defined here.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::commands::WriteCommand;
use crate::error::{Error, Result};
use crate::topology::CacheTopology;
use crate::types::{NodeId, TopologyId};

/// Globally unique identifier of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalTransactionId {
    /// The node the transaction originated on.
    pub origin: NodeId,
    /// Unique id within the originator.
    pub id: Uuid,
}

impl GlobalTransactionId {
    /// Create a fresh id originating on `origin`.
    pub fn new(origin: NodeId) -> Self {
        Self {
            origin,
            id: Uuid::new_v4(),
        }
    }
}

impl std::fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx:{}:{}", self.origin, self.id)
    }
}

/// A prepared remote transaction transferred from a previous owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Global id of the transaction.
    pub global_tx: GlobalTransactionId,

    /// The modifications the transaction prepared.
    pub modifications: Vec<WriteCommand>,

    /// Keys the transaction holds locks on.
    pub locked_keys: Vec<Bytes>,
}

/// Handle of a local transaction started by the [`TransactionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle(pub u64);

/// Seam to the local transaction manager.
///
/// Present only for transactional caches; each transferred entry is applied
/// inside its own transaction.
#[async_trait]
pub trait TransactionManager: Send + Sync + std::fmt::Debug {
    /// Begin a new transaction.
    async fn begin(&self) -> Result<TransactionHandle>;

    /// Commit a transaction.
    async fn commit(&self, tx: TransactionHandle) -> Result<()>;

    /// Roll a transaction back.
    async fn rollback(&self, tx: TransactionHandle) -> Result<()>;

    /// Whether the transaction is still live (not committed or rolled back).
    fn is_active(&self, tx: TransactionHandle) -> bool;
}

/// A remote transaction recreated from transferred state.
///
/// The lookup topology is forced one behind the transfer topology so the node
/// replays the transaction data instead of assuming it already has it.
#[derive(Debug)]
pub struct RemoteTransaction {
    global_tx: GlobalTransactionId,
    modifications: Vec<WriteCommand>,
    lookup_topology_id: AtomicU64,
    backup_locks: Mutex<HashSet<Bytes>>,
}

impl RemoteTransaction {
    /// Create a remote transaction with its prepared modifications.
    pub fn new(global_tx: GlobalTransactionId, modifications: Vec<WriteCommand>) -> Self {
        Self {
            global_tx,
            modifications,
            lookup_topology_id: AtomicU64::new(0),
            backup_locks: Mutex::new(HashSet::new()),
        }
    }

    /// Global id of the transaction.
    pub fn global_tx(&self) -> GlobalTransactionId {
        self.global_tx
    }

    /// The prepared modifications.
    pub fn modifications(&self) -> &[WriteCommand] {
        &self.modifications
    }

    /// Set the topology id the transaction's entries were looked up in.
    pub fn set_lookup_topology_id(&self, topology_id: TopologyId) {
        self.lookup_topology_id.store(topology_id, Ordering::SeqCst);
    }

    /// The topology id the transaction's entries were looked up in.
    pub fn lookup_topology_id(&self) -> TopologyId {
        self.lookup_topology_id.load(Ordering::SeqCst)
    }

    /// Register a backup lock for a key.
    pub fn add_backup_lock(&self, key: Bytes) {
        self.backup_locks.lock().insert(key);
    }

    /// Whether a backup lock is held for the key.
    pub fn has_backup_lock(&self, key: &[u8]) -> bool {
        self.backup_locks.lock().contains(key)
    }

    /// Snapshot of the keys currently backup-locked.
    pub fn backup_locks(&self) -> HashSet<Bytes> {
        self.backup_locks.lock().clone()
    }
}

/// Seam to the cache's transaction table.
pub trait TransactionTable: Send + Sync + std::fmt::Debug {
    /// Find or create the remote-transaction entry for a global id.
    fn get_or_create_remote_transaction(
        &self,
        global_tx: GlobalTransactionId,
        modifications: Vec<WriteCommand>,
    ) -> Arc<RemoteTransaction>;

    /// Evict transactions whose originators are not members of `topology`.
    fn cleanup_stale_transactions(&self, topology: &CacheTopology);
}

/// A latch blocking state transfer until an in-flight total-order
/// transaction finishes.
#[derive(Debug)]
pub struct TotalOrderLatch {
    rx: watch::Receiver<bool>,
}

impl TotalOrderLatch {
    /// Block until the latch is released.
    ///
    /// Fails with [`Error::Interrupted`] if the releasing side went away
    /// without unblocking.
    pub async fn await_unblock(&mut self) -> Result<()> {
        while !*self.rx.borrow() {
            self.rx.changed().await.map_err(|_| Error::Interrupted)?;
        }
        Ok(())
    }
}

/// Releasing side of a [`TotalOrderLatch`].
#[derive(Debug, Clone)]
pub struct TotalOrderLatchHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl TotalOrderLatchHandle {
    /// Release every latch cloned from this handle.
    pub fn unblock(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a latch and its releasing handle.
pub fn total_order_latch() -> (TotalOrderLatchHandle, TotalOrderLatch) {
    let (tx, rx) = watch::channel(false);
    (
        TotalOrderLatchHandle { tx: Arc::new(tx) },
        TotalOrderLatch { rx },
    )
}

/// Seam to the total-order transaction protocol.
///
/// Before a total-order cache changes topology, all remote transactions
/// prepared under the previous topology must drain.
pub trait TotalOrderManager: Send + Sync + std::fmt::Debug {
    /// Announce that state transfer starts and collect one latch per
    /// in-flight remote transaction that must finish first.
    fn state_transfer_start(&self, topology_id: TopologyId) -> Vec<TotalOrderLatch>;

    /// Announce that the rebalance finished.
    fn state_transfer_end(&self);
}
