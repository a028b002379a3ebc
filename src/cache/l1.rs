//! L1 Cache - RAM-based Hot Cache
//!
//! Bounded in-process cache with pluggable eviction and TTL expiry.
//!
//! # Design
//!
//! - One mutex around the map, the eviction queue and the tag index; it is
//!   never held across an `.await`
//! - Two independent bounds: entry count and accounted bytes
//! - Lazy expiry on read plus an explicit sweep (`purge_expired`)
//! - O(log n) victim selection through [`EvictionQueue`]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entry::{CacheEntry, CacheValue};
use super::policy::{EvictionPolicy, EvictionPolicyKind, EvictionQueue};
use super::stats::{CacheStatistics, TierCounters};
use super::{DEFAULT_L1_MAX_ENTRIES, DEFAULT_L1_MAX_MEMORY_MB};

const MIB: f64 = 1024.0 * 1024.0;

/// L1 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Maximum number of entries
    pub max_size: usize,
    /// Maximum accounted memory in MiB
    pub max_memory_mb: f64,
    /// Victim selection when a bound is exceeded
    pub eviction_policy: EvictionPolicyKind,
    /// TTL applied when `set` is called without one
    #[serde(with = "crate::config::opt_duration")]
    pub default_ttl: Option<Duration>,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_L1_MAX_ENTRIES,
            max_memory_mb: DEFAULT_L1_MAX_MEMORY_MB,
            eviction_policy: EvictionPolicyKind::Lru,
            default_ttl: None,
        }
    }
}

impl L1Config {
    /// Memory bound in bytes
    pub fn max_memory_bytes(&self) -> u64 {
        (self.max_memory_mb * MIB) as u64
    }
}

struct L1State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    queue: EvictionQueue,
    tags: HashMap<String, HashSet<String>>,
    total_size: u64,
}

impl<V> L1State<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            queue: EvictionQueue::new(),
            tags: HashMap::new(),
            total_size: 0,
        }
    }

    fn insert(&mut self, entry: CacheEntry<V>, policy: &dyn EvictionPolicy) {
        let key = entry.key.clone();
        self.remove(&key);

        self.queue
            .upsert(&key, policy.rank(entry.access_count, entry.touch()));
        for tag in &entry.tags {
            self.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.total_size += entry.size_bytes;
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.queue.remove(key);
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        self.total_size = self.total_size.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.queue.clear();
        self.tags.clear();
        self.total_size = 0;
    }
}

/// L1 Cache - RAM-based hot cache
pub struct L1Cache<V> {
    state: Mutex<L1State<V>>,
    config: L1Config,
    max_memory_bytes: u64,
    policy: Arc<dyn EvictionPolicy>,
    counters: TierCounters,
}

impl<V: CacheValue> L1Cache<V> {
    /// Create a new L1 cache with default configuration
    pub fn new() -> Self {
        Self::with_config(L1Config::default())
    }

    /// Create a new L1 cache with custom configuration
    pub fn with_config(config: L1Config) -> Self {
        let policy = config.eviction_policy.build();
        Self::with_policy(config, policy)
    }

    /// Create with a custom eviction policy
    pub fn with_policy(config: L1Config, policy: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            state: Mutex::new(L1State::new()),
            max_memory_bytes: config.max_memory_bytes(),
            config,
            policy,
            counters: TierCounters::new(),
        }
    }

    /// Get a value from the cache
    ///
    /// An expired entry is removed and counted as an expiration, not a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.is_expired(),
            None => {
                self.counters.record_miss();
                return None;
            }
        };

        if expired {
            state.remove(key);
            self.counters.record_expirations(1);
            debug!(key, "L1 entry expired");
            return None;
        }

        let entry = state.entries.get_mut(key)?;
        entry.access();
        let rank = self.policy.rank(entry.access_count, entry.touch());
        let value = entry.value.clone();
        state.queue.upsert(key, rank);
        self.counters.record_hit();
        Some(value)
    }

    /// Insert or replace a value
    ///
    /// `ttl = None` falls back to the configured default TTL; a zero TTL
    /// removes any existing entry and stores nothing.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>, tags: &[String]) {
        let ttl = ttl.or(self.config.default_ttl);
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            self.delete(key);
            return;
        }
        let entry = CacheEntry::new(key, value, ttl, tags.iter().cloned());
        self.put_entry(entry);
    }

    /// Insert a prepared entry (tier promotion keeps expiry and tags)
    pub fn put_entry(&self, entry: CacheEntry<V>) {
        if entry.is_expired() {
            self.delete(&entry.key);
            return;
        }
        let mut state = self.state.lock();
        state.insert(entry, self.policy.as_ref());
        self.enforce_capacity(&mut state);
    }

    /// Evict until both bounds hold again
    fn enforce_capacity(&self, state: &mut L1State<V>) {
        let mut evicted = 0;
        while state.entries.len() > self.config.max_size
            || state.total_size > self.max_memory_bytes
        {
            let Some(victim) = state.queue.pop() else {
                break;
            };
            if state.remove(&victim).is_some() {
                evicted += 1;
                debug!(key = %victim, policy = self.policy.name(), "L1 eviction");
            }
        }
        if evicted > 0 {
            self.counters.record_evictions(evicted);
        }
    }

    /// Remove an entry; true if it existed
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every entry carrying `tag`, returning the removed keys
    pub fn delete_by_tag(&self, tag: &str) -> Vec<String> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            state.remove(key);
        }
        keys
    }

    /// Active expiry sweep; returns the number of entries removed
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        let now = Utc::now();
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        if !expired.is_empty() {
            self.counters.record_expirations(expired.len() as u64);
        }
        expired.len()
    }

    /// Check presence without touching recency or counters
    ///
    /// Expired-but-unswept entries count as absent.
    pub fn contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Metadata copy of an entry without recording an access
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Keys currently held (including expired-but-unswept ones)
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Clear the cache; cumulative counters are kept
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted bytes
    pub fn size(&self) -> u64 {
        self.state.lock().total_size
    }

    /// Get configuration
    pub fn config(&self) -> &L1Config {
        &self.config
    }

    /// Active eviction policy
    pub fn policy(&self) -> &dyn EvictionPolicy {
        self.policy.as_ref()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatistics {
        let (entries, size) = {
            let state = self.state.lock();
            (state.entries.len() as u64, state.total_size)
        };
        self.counters.snapshot(entries, size)
    }
}

impl<V: CacheValue> Default for L1Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lru(max_size: usize) -> L1Cache<String> {
        L1Cache::with_config(L1Config {
            max_size,
            ..Default::default()
        })
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_basic_operations() {
        let cache = lru(5);

        cache.set("key1", "value1".into(), None, &[]);
        assert_eq!(cache.get("key1").as_deref(), Some("value1"));
        assert_eq!(cache.stats().hits, 1);

        assert!(cache.get("key2").is_none());
        assert_eq!(cache.stats().misses, 1);

        assert!(cache.delete("key1"));
        assert!(!cache.delete("key1"));
        assert!(cache.get("key1").is_none());
    }

    #[test]
    fn test_replace_updates_size() {
        let cache = lru(5);

        cache.set("k", "ab".into(), None, &[]);
        assert_eq!(cache.size(), 4);

        cache.set("k", "abcdef".into(), None, &[]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 8);
        assert_eq!(cache.get("k").as_deref(), Some("abcdef"));
    }

    #[test]
    fn test_ttl_expiration() {
        let cache = lru(5);
        cache.set("key1", "value1".into(), Some(Duration::from_millis(100)), &[]);

        assert_eq!(cache.get("key1").as_deref(), Some("value1"));

        std::thread::sleep(Duration::from_millis(200));

        assert!(cache.get("key1").is_none());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entry_count, 0);
    }

    #[test]
    fn test_default_ttl_applies() {
        let cache: L1Cache<String> = L1Cache::with_config(L1Config {
            default_ttl: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        cache.set("k", "v".into(), None, &[]);
        assert!(cache.contains("k"));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!cache.contains("k"));
    }

    #[test]
    fn test_zero_ttl_stores_nothing() {
        let cache = lru(5);
        cache.set("k", "old".into(), None, &[]);
        cache.set("k", "new".into(), Some(Duration::ZERO), &[]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = lru(3);

        cache.set("a", "A".into(), None, &[]);
        cache.set("b", "B".into(), None, &[]);
        cache.set("c", "C".into(), None, &[]);

        cache.get("a");
        cache.set("d", "D".into(), None, &[]);

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lfu_eviction() {
        let cache: L1Cache<String> = L1Cache::with_config(L1Config {
            max_size: 3,
            eviction_policy: EvictionPolicyKind::Lfu,
            ..Default::default()
        });

        cache.set("a", "A".into(), None, &[]);
        cache.set("b", "B".into(), None, &[]);
        cache.set("c", "C".into(), None, &[]);

        cache.get("a");
        cache.get("a");
        cache.get("b");

        cache.set("d", "D".into(), None, &[]);

        assert!(cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(!cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_lfu_tie_breaks_by_recency() {
        let cache: L1Cache<u32> = L1Cache::with_config(L1Config {
            max_size: 2,
            eviction_policy: EvictionPolicyKind::Lfu,
            ..Default::default()
        });

        cache.set("old", 1, None, &[]);
        cache.set("new", 2, None, &[]);
        cache.set("newest", 3, None, &[]);

        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));
        assert!(cache.contains("newest"));
    }

    #[test]
    fn test_memory_limit_eviction() {
        let cache: L1Cache<String> = L1Cache::with_config(L1Config {
            max_size: 100,
            max_memory_mb: 1000.0 / MIB,
            ..Default::default()
        });

        let large = "x".repeat(500);
        cache.set("key1", large.clone(), None, &[]);
        cache.set("key2", large.clone(), None, &[]);
        cache.set("key3", large, None, &[]);

        let stats = cache.stats();
        assert!(stats.evictions >= 1);
        assert!(stats.total_size_bytes <= 1000);
    }

    #[test]
    fn test_oversized_value_is_not_kept() {
        let cache: L1Cache<String> = L1Cache::with_config(L1Config {
            max_memory_mb: 10.0 / MIB,
            ..Default::default()
        });
        cache.set("big", "y".repeat(64), None, &[]);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_tags_and_delete_by_tag() {
        let cache: L1Cache<u32> = L1Cache::new();
        cache.set("a", 1, None, &tags(&["t"]));
        cache.set("b", 2, None, &tags(&["t", "u"]));
        cache.set("c", 3, None, &tags(&["u"]));

        let entry = cache.entry("b").unwrap();
        assert!(entry.has_tag("t") && entry.has_tag("u"));

        let mut removed = cache.delete_by_tag("t");
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
        assert!(cache.contains("c"));
        assert!(cache.delete_by_tag("t").is_empty());
        assert_eq!(cache.delete_by_tag("u"), vec!["c".to_string()]);
    }

    #[test]
    fn test_replace_drops_stale_tags() {
        let cache: L1Cache<u32> = L1Cache::new();
        cache.set("a", 1, None, &tags(&["old"]));
        cache.set("a", 2, None, &tags(&["new"]));
        assert!(cache.delete_by_tag("old").is_empty());
        assert_eq!(cache.delete_by_tag("new"), vec!["a".to_string()]);
    }

    #[test]
    fn test_purge_expired() {
        let cache = lru(10);
        cache.set("short", "s".into(), Some(Duration::from_millis(20)), &[]);
        cache.set("long", "l".into(), Some(Duration::from_secs(60)), &[]);
        cache.set("forever", "f".into(), None, &[]);

        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_clear_keeps_counters() {
        let cache = lru(5);
        for i in 0..3 {
            cache.set(&format!("key{}", i), format!("value{}", i), None, &[]);
        }
        cache.get("key0");
        assert_eq!(cache.stats().entry_count, 3);

        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.total_size_bytes, 0);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let cache: Arc<L1Cache<Vec<u8>>> = Arc::new(L1Cache::with_config(L1Config {
            max_size: 10_000,
            ..Default::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("obj-{}-{}", t, i);
                        cache.set(&key, vec![i as u8; 16], None, &[]);
                        cache.get(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 4000);
        assert_eq!(cache.stats().hits, 4000);
    }

    proptest! {
        #[test]
        fn prop_capacity_invariant(
            ops in proptest::collection::vec((0u8..40, 0usize..300), 1..200),
            lfu in any::<bool>(),
        ) {
            let config = L1Config {
                max_size: 8,
                max_memory_mb: 1024.0 / MIB,
                eviction_policy: if lfu { EvictionPolicyKind::Lfu } else { EvictionPolicyKind::Lru },
                default_ttl: None,
            };
            let max_bytes = config.max_memory_bytes();
            let cache: L1Cache<String> = L1Cache::with_config(config);

            for (key, len) in ops {
                let key = format!("k{}", key);
                cache.set(&key, "z".repeat(len), None, &[]);
                if len % 3 == 0 {
                    cache.get(&key);
                }
                let stats = cache.stats();
                prop_assert!(stats.entry_count <= 8);
                prop_assert!(stats.total_size_bytes <= max_bytes);
            }
        }
    }
}
