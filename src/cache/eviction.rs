//! Eviction candidate ordering.
//!
//! Eviction order is strict and testable:
//! 1. non-priority entries before any priority entry;
//! 2. within each class, oldest `completed_at` first;
//! 3. ties broken by smallest digest lexicographically.
//!
//! Priority entries are reached only when no non-priority candidate remains;
//! the budget is a soft cap, so an all-priority over-budget store still
//! evicts its oldest priority entry rather than grow without bound.

use crate::digest::Digest;

/// One entry under consideration for eviction.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    /// Entry digest.
    pub digest: Digest,
    /// Monotonic completion timestamp.
    pub completed_at: u64,
    /// Charged bytes this eviction would reclaim.
    pub charged_bytes: u64,
    /// Whether the digest is in the priority set at decision time.
    pub priority: bool,
}

/// Result of one eviction tick.
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    /// Digests removed, with the charged bytes each reclaimed.
    pub evicted: Vec<(Digest, u64)>,
    /// Total bytes reclaimed.
    pub bytes_reclaimed: u64,
}

impl EvictionReport {
    /// Record one removal.
    pub fn record(&mut self, digest: Digest, bytes: u64) {
        self.bytes_reclaimed += bytes;
        self.evicted.push((digest, bytes));
    }
}

/// Sort candidates into strict eviction order.
pub fn order_candidates(mut candidates: Vec<EvictionCandidate>) -> Vec<EvictionCandidate> {
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.completed_at.cmp(&b.completed_at))
            .then_with(|| a.digest.cmp(&b.digest))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_of_bytes;

    fn candidate(name: &str, completed_at: u64, priority: bool) -> EvictionCandidate {
        EvictionCandidate {
            digest: digest_of_bytes(name.as_bytes()),
            completed_at,
            charged_bytes: 100,
            priority,
        }
    }

    #[test]
    fn non_priority_sorts_before_priority() {
        let ordered = order_candidates(vec![
            candidate("protected", 1, true),
            candidate("plain", 100, false),
        ]);

        assert!(!ordered[0].priority);
        assert!(ordered[1].priority);
    }

    #[test]
    fn oldest_completed_at_first_within_class() {
        let ordered = order_candidates(vec![
            candidate("newer", 200, false),
            candidate("older", 100, false),
        ]);

        assert_eq!(ordered[0].completed_at, 100);
        assert_eq!(ordered[1].completed_at, 200);
    }

    #[test]
    fn timestamp_ties_break_on_digest() {
        let a = candidate("a", 100, false);
        let b = candidate("b", 100, false);
        let expected_first = a.digest.clone().min(b.digest.clone());

        let ordered = order_candidates(vec![b, a]);

        assert_eq!(ordered[0].digest, expected_first);
    }

    #[test]
    fn priority_entries_keep_lru_order_among_themselves() {
        let ordered = order_candidates(vec![
            candidate("p-new", 300, true),
            candidate("p-old", 100, true),
            candidate("plain", 200, false),
        ]);

        assert!(!ordered[0].priority);
        assert_eq!(ordered[1].completed_at, 100);
        assert_eq!(ordered[2].completed_at, 300);
    }

    #[test]
    fn ordering_is_deterministic() {
        let make = || {
            vec![
                candidate("x", 5, false),
                candidate("y", 5, false),
                candidate("z", 1, true),
            ]
        };
        let a: Vec<_> = order_candidates(make())
            .into_iter()
            .map(|c| c.digest)
            .collect();
        let b: Vec<_> = order_candidates(make())
            .into_iter()
            .map(|c| c.digest)
            .collect();
        assert_eq!(a, b);
    }
}
