//! Error types for the cache node.

use thiserror::Error;

use crate::types::NodeId;

/// Result type alias for state-transfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cache node.
#[derive(Error, Debug)]
pub enum Error {
    /// An RPC to a peer failed or the peer left the cluster.
    ///
    /// Transport failures are handled locally: the source is excluded and the
    /// affected segments are retried against another owner.
    #[error("transport error contacting node {node}: {reason}")]
    Transport { node: NodeId, reason: String },

    /// The operation timed out.
    ///
    /// Treated the same as a transport failure by the retry logic.
    #[error("operation timed out")]
    Timeout,

    /// A blocking wait was interrupted (the other end went away).
    ///
    /// Unlike transport failures, interruption propagates to the caller.
    #[error("operation interrupted")]
    Interrupted,

    /// Applying a single entry failed.
    ///
    /// Logged per key; the remaining entries of the chunk continue.
    #[error("failed to apply entry: {0}")]
    Application(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transport error for a given peer.
    pub fn transport(node: NodeId, reason: impl Into<String>) -> Self {
        Error::Transport {
            node,
            reason: reason.into(),
        }
    }

    /// Whether the error is a transport-level failure that should be retried
    /// against a different source.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
