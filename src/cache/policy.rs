//! Cache Eviction Policies
//!
//! A policy ranks entries; the lowest rank is the next eviction candidate.
//! Ranks are kept in an ordered queue so candidate selection is O(log n)
//! instead of a scan over every entry on the write path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Ordering key for eviction: `(primary, touch)`.
///
/// `touch` is unique per access, so ranks never collide.
pub type EvictionRank = (u64, u64);

/// Eviction policy: maps an entry's usage to its eviction rank.
pub trait EvictionPolicy: Send + Sync + std::fmt::Debug {
    /// Policy name
    fn name(&self) -> &'static str;

    /// Rank for an entry (lower = evicted sooner)
    fn rank(&self, access_count: u64, touch: u64) -> EvictionRank;
}

/// Least recently used: the oldest touch goes first
#[derive(Debug, Clone, Copy, Default)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "LRU"
    }

    fn rank(&self, _access_count: u64, touch: u64) -> EvictionRank {
        (0, touch)
    }
}

/// Least frequently used: lowest access count first, ties by oldest touch
#[derive(Debug, Clone, Copy, Default)]
pub struct LfuPolicy;

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "LFU"
    }

    fn rank(&self, access_count: u64, touch: u64) -> EvictionRank {
        (access_count, touch)
    }
}

/// Configurable policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictionPolicyKind {
    /// Least recently used
    #[default]
    #[serde(rename = "LRU", alias = "lru")]
    Lru,
    /// Least frequently used
    #[serde(rename = "LFU", alias = "lfu")]
    Lfu,
}

impl EvictionPolicyKind {
    /// Instantiate the policy
    pub fn build(self) -> Arc<dyn EvictionPolicy> {
        match self {
            EvictionPolicyKind::Lru => Arc::new(LruPolicy),
            EvictionPolicyKind::Lfu => Arc::new(LfuPolicy),
        }
    }
}

impl std::fmt::Display for EvictionPolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicyKind::Lru => write!(f, "LRU"),
            EvictionPolicyKind::Lfu => write!(f, "LFU"),
        }
    }
}

/// Keys ordered by eviction rank
#[derive(Debug, Default)]
pub struct EvictionQueue {
    order: BTreeMap<EvictionRank, String>,
    ranks: HashMap<String, EvictionRank>,
}

impl EvictionQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key or move it to a new rank
    pub fn upsert(&mut self, key: &str, rank: EvictionRank) {
        if let Some(old) = self.ranks.insert(key.to_string(), rank) {
            self.order.remove(&old);
        }
        self.order.insert(rank, key.to_string());
    }

    /// Forget a key
    pub fn remove(&mut self, key: &str) -> bool {
        match self.ranks.remove(key) {
            Some(rank) => {
                self.order.remove(&rank);
                true
            }
            None => false,
        }
    }

    /// Next eviction candidate without removing it
    pub fn candidate(&self) -> Option<&str> {
        self.order.values().next().map(String::as_str)
    }

    /// Remove and return the next eviction candidate
    pub fn pop(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.ranks.remove(&key);
        Some(key)
    }

    /// Number of queued keys
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Drop every key
    pub fn clear(&mut self) {
        self.order.clear();
        self.ranks.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_ignores_frequency() {
        let policy = LruPolicy;
        assert!(policy.rank(100, 1) < policy.rank(0, 2));
        assert_eq!(policy.name(), "LRU");
    }

    #[test]
    fn test_lfu_orders_by_count_then_touch() {
        let policy = LfuPolicy;
        assert!(policy.rank(0, 10) < policy.rank(1, 1));
        assert!(policy.rank(2, 3) < policy.rank(2, 4));
        assert_eq!(policy.name(), "LFU");
    }

    #[test]
    fn test_policy_kind_build() {
        assert_eq!(EvictionPolicyKind::Lru.build().name(), "LRU");
        assert_eq!(EvictionPolicyKind::Lfu.build().name(), "LFU");
        assert_eq!(EvictionPolicyKind::default(), EvictionPolicyKind::Lru);
    }

    #[test]
    fn test_policy_kind_serde() {
        let kind: EvictionPolicyKind = serde_json::from_str("\"LFU\"").unwrap();
        assert_eq!(kind, EvictionPolicyKind::Lfu);
        let kind: EvictionPolicyKind = serde_json::from_str("\"lru\"").unwrap();
        assert_eq!(kind, EvictionPolicyKind::Lru);
        assert_eq!(serde_json::to_string(&EvictionPolicyKind::Lfu).unwrap(), "\"LFU\"");
    }

    #[test]
    fn test_queue_pops_lowest_rank() {
        let mut queue = EvictionQueue::new();
        queue.upsert("a", (0, 1));
        queue.upsert("b", (0, 2));
        queue.upsert("c", (0, 3));

        // Re-ranking "a" moves it behind the others
        queue.upsert("a", (0, 4));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.candidate(), Some("b"));

        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert_eq!(queue.pop().as_deref(), Some("c"));
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_remove() {
        let mut queue = EvictionQueue::new();
        queue.upsert("a", (1, 1));
        queue.upsert("b", (0, 2));

        assert!(queue.remove("b"));
        assert!(!queue.remove("b"));
        assert_eq!(queue.candidate(), Some("a"));

        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.candidate().is_none());
    }
}
