//! Cache Entry Types
//!
//! A single cached value plus the metadata the tiers need for expiry,
//! eviction ranking and tag invalidation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Values that can live in any tier.
///
/// L2 persists values as JSON, and L1 sizes them by their encoded length, so
/// every cached type must round-trip through serde.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Process-wide recency clock.
///
/// Wall-clock timestamps can tie when entries are touched in quick
/// succession; the touch stamp gives a strict total order instead.
static TOUCH_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Take the next touch stamp
#[inline]
pub fn next_touch() -> u64 {
    TOUCH_CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Estimate the footprint of a value for memory accounting.
///
/// Uses the JSON-encoded length; falls back to the in-memory size of `V`
/// when the value refuses to serialize.
pub fn estimate_size<V: Serialize>(value: &V) -> u64 {
    serde_json::to_vec(value)
        .map(|encoded| encoded.len() as u64)
        .unwrap_or(std::mem::size_of::<V>() as u64)
}

/// Compute an absolute expiry from a TTL.
///
/// A TTL too large for chrono to represent means "never expires".
pub fn expiry_from(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    let delta = chrono::Duration::from_std(ttl).ok()?;
    now.checked_add_signed(delta)
}

/// Cache entry containing a value and its metadata
#[derive(Clone)]
pub struct CacheEntry<V> {
    /// Key as stored in the owning tier
    pub key: String,
    /// Cached value
    pub value: V,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last successful read (or creation)
    pub accessed_at: DateTime<Utc>,
    /// Absolute expiry, `None` = no TTL
    pub expires_at: Option<DateTime<Utc>>,
    /// Successful reads since creation
    pub access_count: u64,
    /// Labels for bulk invalidation
    pub tags: BTreeSet<String>,
    /// Accounted size in bytes
    pub size_bytes: u64,
    touch: u64,
}

impl<V: Serialize> CacheEntry<V> {
    /// Create a new entry, sizing it from the encoded value
    pub fn new(
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
        tags: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = Utc::now();
        let size_bytes = estimate_size(&value);
        Self::with_expiry(key, value, now, expiry_from(now, ttl), tags, size_bytes)
    }
}

impl<V> CacheEntry<V> {
    /// Create an entry with an explicit absolute expiry (tier transfers)
    pub fn with_expiry(
        key: impl Into<String>,
        value: V,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        tags: impl IntoIterator<Item = String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            created_at,
            accessed_at: created_at,
            expires_at,
            access_count: 0,
            tags: tags.into_iter().collect(),
            size_bytes,
            touch: next_touch(),
        }
    }

    /// Check if entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against a given instant
    #[inline]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }

    /// Record a successful read
    pub fn access(&mut self) {
        self.access_count += 1;
        self.accessed_at = Utc::now();
        self.touch = next_touch();
    }

    /// Remaining lifetime, `None` when the entry never expires
    pub fn ttl_remaining(&self) -> Option<Duration> {
        let expires_at = self.expires_at?;
        Some((expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Recency stamp used for eviction ordering
    #[inline]
    pub fn touch(&self) -> u64 {
        self.touch
    }

    /// Whether the entry carries a tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

impl<V> std::fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size_bytes", &self.size_bytes)
            .field("access_count", &self.access_count)
            .field("expires_at", &self.expires_at)
            .field("tags", &self.tags)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
