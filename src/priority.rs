//! Priority digest set.
//!
//! External policy (the active review queue) marks a set of digests whose
//! cache entries must be evicted last. The set is replaced wholesale in one
//! step; readers always observe either the old or the new set in full.
//! Membership alone is the signal: no LRU, no TTL.

use crate::digest::Digest;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Mutable set of eviction-protected digests.
///
/// Shared between the coordinator (writer) and the cache store (reader on
/// every eviction-candidate evaluation).
pub struct PriorityIndex {
    current: RwLock<Arc<HashSet<Digest>>>,
}

impl PriorityIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(HashSet::new())),
        }
    }

    /// Replace the whole set atomically.
    pub fn set(&self, digests: HashSet<Digest>) {
        let mut guard = self.current.write().expect("priority index lock poisoned");
        *guard = Arc::new(digests);
    }

    /// Snapshot of the current set.
    ///
    /// The returned `Arc` is immutable; a concurrent [`set`](Self::set) does
    /// not alter it.
    pub fn snapshot(&self) -> Arc<HashSet<Digest>> {
        Arc::clone(&self.current.read().expect("priority index lock poisoned"))
    }

    /// Membership test against the current set.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.current
            .read()
            .expect("priority index lock poisoned")
            .contains(digest)
    }

    /// Number of protected digests.
    pub fn len(&self) -> usize {
        self.current
            .read()
            .expect("priority index lock poisoned")
            .len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PriorityIndex {
    fn default() -> Self {
        Self::new()
    }
}
