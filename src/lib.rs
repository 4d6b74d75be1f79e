//! Distributed in-memory cache node: consistent-hash segment ownership and
//! inbound state transfer.
//!
//! Data is horizontally partitioned into a fixed number of segments, each
//! owned by one or more cluster members according to a consistent-hash
//! assignment. When membership changes, segments migrate between nodes while
//! the cache keeps serving reads and writes. This crate implements the
//! incoming side of that migration on a single node — the
//! [`StateConsumer`]:
//!
//! - reconciles topology updates pushed by the cluster coordinator
//! - decides which segments to pull and picks a source per segment
//! - fetches prepared transactions and entry chunks from remote owners
//! - applies received entries locally, letting user writes win
//! - cancels or retries broken transfers and reports completion
//!
//! # Example
//!
//! ```rust,ignore
//! use doppio::{CacheMode, StateConsumer, StateTransferConfig};
//!
//! let consumer = StateConsumer::builder(node_id, StateTransferConfig::default(), CacheMode::NonTx)
//!     .rpc(rpc)
//!     .invoker(interceptor_chain)
//!     .data_container(container)
//!     .notifier(notifier)
//!     .build()?;
//! consumer.start();
//!
//! // pushed by the topology coordinator:
//! consumer.on_topology_update(topology, true).await?;
//! // pushed by the transport when a peer streams entries:
//! consumer.apply_state(sender, topology_id, chunks).await;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │             Topology Coordinator              │
//! └───────────────────────────────────────────────┘
//!                 │ on_topology_update
//!                 ▼
//! ┌───────────────────────────────────────────────┐
//! │                StateConsumer                  │
//! │  segment delta → invalidate → select sources  │
//! │  → fetch transactions → register transfers    │
//! └───────────────────────────────────────────────┘
//!       │                │                 │
//!       ▼                ▼                 ▼
//! ┌───────────┐   ┌─────────────┐   ┌───────────┐
//! │ Transfer  │   │  Transfer   │   │   State   │
//! │ Registry  │   │    Pump     │   │  Applier  │
//! └───────────┘   └─────────────┘   └───────────┘
//! ```
//!
//! The collaborators the consumer drives (RPC transport, interceptor chain,
//! persistence, transactions, notifications, L1) are trait seams; see
//! [`commands`], [`container`], [`txn`] and [`events`].

pub mod commands;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod statetransfer;
pub mod testing;
pub mod topology;
pub mod txn;
pub mod types;

// Re-export main types for convenience
pub use commands::{
    ClusterListenerSpec, CommandInvoker, InvocationContext, RpcManager, StateChunk, StateRequest,
    StateResponse, WriteCommand, WriteFlags,
};
pub use config::StateTransferConfig;
pub use container::{DataContainer, MapDataContainer, NoStores, PersistenceManager};
pub use error::{Error, Result};
pub use events::{CacheNotifier, KeyInvalidationListener, L1Manager, NoL1};
pub use statetransfer::{CacheMode, StateConsumer, StateConsumerBuilder, TaskStatus};
pub use topology::{CacheTopology, ConsistentHash};
pub use txn::{
    GlobalTransactionId, RemoteTransaction, TotalOrderLatch, TotalOrderLatchHandle,
    TotalOrderManager, TransactionHandle, TransactionInfo, TransactionManager, TransactionTable,
};
pub use types::{CacheEntry, NodeId, SegmentId, StateTransferStats, TopologyId};
