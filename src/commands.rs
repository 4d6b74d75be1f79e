//! Commands and wire messages used by state transfer.
//!
//! Local writes (entry application, invalidation) are expressed as
//! [`WriteCommand`]s and executed through the cache's interceptor chain via
//! the [`CommandInvoker`] seam. Remote coordination uses [`StateRequest`] /
//! [`StateResponse`] messages carried by the [`RpcManager`] seam.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::txn::TransactionHandle;
use crate::types::{CacheEntry, NodeId, SegmentId, TopologyId};

/// Flags attached to a write command.
///
/// State-transfer writes must bypass the interceptors that assume user intent
/// and must never race against replication; the flag set tells the chain
/// which behaviors to skip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFlags {
    /// The write carries transferred state, not a user mutation.
    pub put_for_state_transfer: bool,
    /// Execute only on this node, never replicate.
    pub cache_mode_local: bool,
    /// The previous value is not needed.
    pub ignore_return_values: bool,
    /// Do not fetch the previous value from a remote owner.
    pub skip_remote_lookup: bool,
    /// Do not write through shared cache stores.
    pub skip_shared_store: bool,
    /// Do not reject the write for lack of ownership.
    pub skip_ownership_check: bool,
    /// Do not back up the write to remote sites.
    pub skip_xsite_backup: bool,
    /// Do not acquire key locks.
    pub skip_locking: bool,
}

impl WriteFlags {
    /// Flag set for applying transferred entries.
    pub fn state_transfer() -> Self {
        Self {
            put_for_state_transfer: true,
            cache_mode_local: true,
            ignore_return_values: true,
            skip_remote_lookup: true,
            skip_shared_store: true,
            skip_ownership_check: true,
            skip_xsite_backup: true,
            skip_locking: false,
        }
    }

    /// Flag set for invalidating no-longer-owned entries.
    pub fn invalidation() -> Self {
        Self {
            cache_mode_local: true,
            skip_locking: true,
            ..Self::default()
        }
    }
}

/// A write executed through the interceptor chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteCommand {
    /// Insert or update one entry.
    Put {
        key: Bytes,
        value: Bytes,
        /// Absolute expiration in nanoseconds since UNIX epoch, if any.
        expires_at_nanos: Option<u64>,
        flags: WriteFlags,
    },

    /// Remove entries this node no longer owns.
    Invalidate { keys: Vec<Bytes>, flags: WriteFlags },

    /// Demote entries to L1 instead of removing them outright.
    InvalidateL1 { keys: Vec<Bytes>, flags: WriteFlags },
}

impl WriteCommand {
    /// Build the put command applying one transferred entry.
    pub fn put_for_state_transfer(entry: &CacheEntry) -> Self {
        Self::Put {
            key: entry.key.clone(),
            value: entry.value.clone(),
            expires_at_nanos: entry.expires_at_nanos,
            flags: WriteFlags::state_transfer(),
        }
    }

    /// The key a single-key command targets, if any.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Self::Put { key, .. } => Some(key),
            Self::Invalidate { .. } | Self::InvalidateL1 { .. } => None,
        }
    }

    /// The flags attached to the command.
    pub fn flags(&self) -> WriteFlags {
        match self {
            Self::Put { flags, .. }
            | Self::Invalidate { flags, .. }
            | Self::InvalidateL1 { flags, .. } => *flags,
        }
    }
}

/// The calling context a write command executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationContext {
    /// Plain non-transactional context.
    NonTx,
    /// Non-transactional context scoped to a single key.
    SingleKey,
    /// The command runs inside the given transaction.
    Transactional(TransactionHandle),
}

impl InvocationContext {
    /// Whether the context is in transaction scope.
    pub fn is_in_tx_scope(&self) -> bool {
        matches!(self, Self::Transactional(_))
    }
}

/// Seam to the cache's interceptor chain.
///
/// The chain consults the state consumer's updated-keys predicate before
/// committing a state-transfer put, so that user writes always win.
#[async_trait]
pub trait CommandInvoker: Send + Sync + std::fmt::Debug {
    /// Execute a write command in the given context.
    async fn invoke(&self, ctx: &InvocationContext, command: WriteCommand) -> Result<()>;
}

/// A batch of entries for one segment from one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChunk {
    /// The segment the entries belong to.
    pub segment_id: SegmentId,

    /// Entries in this chunk. May be empty for a pure end-of-segment marker.
    pub entries: Vec<CacheEntry>,

    /// Whether this is the last chunk of the segment from this source.
    pub is_last_chunk: bool,
}

impl StateChunk {
    /// Create a chunk.
    pub fn new(segment_id: SegmentId, entries: Vec<CacheEntry>, is_last_chunk: bool) -> Self {
        Self {
            segment_id,
            entries,
            is_last_chunk,
        }
    }

    /// Create an empty end-of-segment marker.
    pub fn last(segment_id: SegmentId) -> Self {
        Self::new(segment_id, Vec::new(), true)
    }
}

/// A cluster-listener registration advertised by another member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterListenerSpec {
    /// Stable identifier of the listener.
    pub id: Uuid,

    /// Optional server-side filter expression.
    pub filter: Option<String>,
}

/// A state-transfer control request sent to a remote owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateRequest {
    /// Request the prepared-but-uncommitted transactions touching `segments`.
    GetTransactions {
        origin: NodeId,
        topology_id: TopologyId,
        segments: Vec<SegmentId>,
    },

    /// Request the cluster-listener registrations known to the target.
    GetCacheListeners { origin: NodeId },

    /// Ask the target to start streaming the listed segments.
    StartTransfer {
        origin: NodeId,
        topology_id: TopologyId,
        segments: Vec<SegmentId>,
    },

    /// Ask the target to stop streaming the listed segments.
    CancelTransfer {
        origin: NodeId,
        topology_id: TopologyId,
        segments: Vec<SegmentId>,
    },
}

impl StateRequest {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetTransactions { .. } => "get-transactions",
            Self::GetCacheListeners { .. } => "get-cache-listeners",
            Self::StartTransfer { .. } => "start-transfer",
            Self::CancelTransfer { .. } => "cancel-transfer",
        }
    }

    /// Serialize to bytes for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from wire bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Response to a [`StateRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateResponse {
    /// Prepared transactions for the requested segments.
    Transactions(Vec<crate::txn::TransactionInfo>),

    /// Cluster-listener registrations known to the responder.
    CacheListeners(Vec<ClusterListenerSpec>),

    /// The request was accepted.
    Ack,
}

/// Seam to the RPC transport.
///
/// `invoke` is synchronous in the protocol sense: it resolves once the target
/// has processed the request. Implementations use ignore-leavers semantics; a
/// target that left the cluster yields [`crate::Error::Transport`] rather
/// than blocking. The consumer wraps every call in the configured
/// state-transfer timeout.
#[async_trait]
pub trait RpcManager: Send + Sync + std::fmt::Debug {
    /// Send a request to one member and wait for its response.
    async fn invoke(&self, target: NodeId, request: StateRequest) -> Result<StateResponse>;
}
