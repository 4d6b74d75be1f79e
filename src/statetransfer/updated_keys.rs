//! Tracking of keys written by user code during a rebalance.

use bytes::Bytes;
use dashmap::DashMap;

/// Concurrent set of keys touched by user writes while state transfer is
/// active. A key present here is untouchable by state transfer: the user
/// write wins over the transferred value.
#[derive(Debug, Default)]
pub(crate) struct UpdatedKeys {
    keys: DashMap<Bytes, ()>,
}

impl UpdatedKeys {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a key as updated by user code.
    pub(crate) fn insert(&self, key: Bytes) {
        self.keys.insert(key, ());
    }

    /// Whether the key was updated by user code.
    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.keys.contains_key(key)
    }

    /// Run `f` iff the key is not recorded, atomically with respect to
    /// concurrent inserts of the same key. The key is not recorded by this
    /// call. Returns whether `f` ran.
    pub(crate) fn run_if_absent(&self, key: &Bytes, f: impl FnOnce()) -> bool {
        // The entry guard holds the shard lock, serializing against insert.
        match self.keys.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(_) => {
                f();
                true
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_contains() {
        let keys = UpdatedKeys::new();
        assert!(!keys.contains(b"k"));
        keys.insert(Bytes::from_static(b"k"));
        assert!(keys.contains(b"k"));
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn run_if_absent_skips_recorded_keys() {
        let keys = UpdatedKeys::new();
        keys.insert(Bytes::from_static(b"taken"));

        let mut ran = false;
        assert!(!keys.run_if_absent(&Bytes::from_static(b"taken"), || ran = true));
        assert!(!ran);

        assert!(keys.run_if_absent(&Bytes::from_static(b"free"), || ran = true));
        assert!(ran);
        // the key is not recorded by the check itself
        assert!(!keys.contains(b"free"));
    }
}
