//! Configuration types for state transfer.

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the inbound side of state transfer.
///
/// Whether the cache is transactional, uses the total-order protocol or runs
/// in invalidation mode is not a flag here: those choices carry collaborators
/// with them and are expressed through [`crate::CacheMode`].
#[derive(Debug, Clone)]
pub struct StateTransferConfig {
    /// Pull in-memory entries from the previous owners of newly added
    /// segments.
    pub fetch_in_memory_state: bool,

    /// Pull entries held only by persistent stores on the previous owners.
    pub fetch_persistent_state: bool,

    /// On rehash, demote entries of no-longer-owned segments to L1 instead of
    /// dropping them, and register previous owners as L1 requestors.
    pub l1_on_rehash: bool,

    /// Timeout applied to every state-transfer RPC and to waiting for an
    /// inbound transfer to complete.
    pub timeout: Duration,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            fetch_in_memory_state: true,
            fetch_persistent_state: false,
            l1_on_rehash: false,
            timeout: Duration::from_secs(240),
        }
    }
}

impl StateTransferConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether in-memory state is fetched.
    pub fn with_fetch_in_memory_state(mut self, fetch: bool) -> Self {
        self.fetch_in_memory_state = fetch;
        self
    }

    /// Set whether persistent state is fetched.
    pub fn with_fetch_persistent_state(mut self, fetch: bool) -> Self {
        self.fetch_persistent_state = fetch;
        self
    }

    /// Set whether removed segments are demoted to L1 on rehash.
    pub fn with_l1_on_rehash(mut self, enabled: bool) -> Self {
        self.l1_on_rehash = enabled;
        self
    }

    /// Set the state-transfer timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether any kind of state is fetched from remote owners.
    pub fn fetch_enabled(&self) -> bool {
        self.fetch_in_memory_state || self.fetch_persistent_state
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::Config("state transfer timeout must be non-zero".into()));
        }
        Ok(())
    }
}
