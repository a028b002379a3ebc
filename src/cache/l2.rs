//! L2 Cache - Durable Warm Cache
//!
//! Size-bounded cache persisted through a [`StorageBackend`].
//!
//! # Layout
//!
//! - One content blob per key: `<16 hex digits>.cache`, named by hashing
//!   `namespace \0 key`. The blob is a codec-tagged frame whose body is the
//!   JSON record (namespace, key, timestamps, tags, value).
//! - One sidecar per namespace: `index-<namespace>.json`, a snapshot of the
//!   in-memory index written by [`L2Cache::flush`]. The first mutation after
//!   a flush replaces it with a small "not clean" marker, so mutations cost
//!   one blob write, not a full index rewrite. A missing, unreadable or
//!   unclean sidecar makes `open` rebuild the index by scanning the blobs.
//!
//! # Design
//!
//! - Index under a `parking_lot::Mutex`; blob I/O happens outside the lock
//! - Blob written before the index changes, so the index never names a
//!   blob that was not written
//! - Writes and removals of one blob name are serialized; a removal skips
//!   blobs a newer write has indexed again
//! - Unreadable payloads fail open: counted as errors, dropped, reported
//!   as a miss

use std::collections::{BTreeSet, HashMap, HashSet};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::{DiskBackend, InMemoryBackend, StorageBackend};
use super::compression::{CompressionConfig, FrameCodec};
use super::entry::{expiry_from, fx_hash, next_touch, CacheEntry, CacheValue};
use super::policy::EvictionQueue;
use super::stats::{CacheStatistics, TierCounters};
use super::{DEFAULT_L2_MAX_SIZE_MB, DEFAULT_NAMESPACE};
use crate::error::{Error, Result};

const MIB: f64 = 1024.0 * 1024.0;

/// Content blob suffix
pub const CONTENT_SUFFIX: &str = ".cache";

/// Sidecar format version
const INDEX_VERSION: u32 = 2;

const BLOB_LOCK_STRIPES: usize = 64;

/// Where L2 blobs live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L2BackendKind {
    /// Files in `disk_path`
    #[default]
    Disk,
    /// Process memory (nothing survives a restart)
    Memory,
}

/// L2 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L2Config {
    /// Storage backend
    pub backend: L2BackendKind,
    /// Storage directory for the disk backend
    pub disk_path: PathBuf,
    /// Maximum stored bytes in MiB (sum of blob sizes)
    pub max_size_mb: f64,
    /// Compress payloads with LZ4
    pub compression: bool,
    /// Isolates caches sharing one directory
    pub namespace: String,
    /// TTL applied when `set` is called without one
    #[serde(with = "crate::config::opt_duration")]
    pub default_ttl: Option<Duration>,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            backend: L2BackendKind::Disk,
            disk_path: PathBuf::from("cache/l2"),
            max_size_mb: DEFAULT_L2_MAX_SIZE_MB,
            compression: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_ttl: None,
        }
    }
}

impl L2Config {
    /// Size bound in bytes
    pub fn max_size_bytes(&self) -> u64 {
        (self.max_size_mb * MIB) as u64
    }

    /// Check the namespace can be embedded in a file name
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config("l2.namespace must not be empty".into()));
        }
        if !self
            .namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::Config(format!(
                "l2.namespace '{}' may only contain [A-Za-z0-9._-]",
                self.namespace
            )));
        }
        if self.max_size_mb.is_nan() || self.max_size_mb <= 0.0 {
            return Err(Error::Config("l2.max_size_mb must be positive".into()));
        }
        Ok(())
    }
}

/// Index record for one L2 entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Blob name
    pub file: String,
    /// Key within the namespace
    pub key: String,
    /// Blob size in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(skip)]
    touch: u64,
}

impl IndexRecord {
    /// Check expiry against a given instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    namespace: String,
    /// False while mutations newer than `records` may exist in storage
    clean: bool,
    records: Vec<IndexRecord>,
}

/// Body of a content blob
#[derive(Serialize, Deserialize)]
struct StoredRecord<T> {
    namespace: String,
    key: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: BTreeSet<String>,
    value: T,
}

/// A content blob without its value, for index rebuilds
#[derive(Deserialize)]
struct StoredHeader {
    namespace: String,
    key: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: BTreeSet<String>,
}

#[derive(Default)]
struct L2State {
    records: HashMap<String, IndexRecord>,
    queue: EvictionQueue,
    tags: HashMap<String, HashSet<String>>,
    total_size: u64,
}

impl L2State {
    fn insert(&mut self, record: IndexRecord) -> Option<IndexRecord> {
        let previous = self.remove(&record.key);
        self.queue.upsert(&record.key, (0, record.touch));
        for tag in &record.tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(record.key.clone());
        }
        self.total_size += record.size;
        self.records.insert(record.key.clone(), record);
        previous
    }

    fn remove(&mut self, key: &str) -> Option<IndexRecord> {
        let record = self.records.remove(key)?;
        self.queue.remove(key);
        for tag in &record.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        self.total_size = self.total_size.saturating_sub(record.size);
        Some(record)
    }

    fn take_all(&mut self) -> Vec<IndexRecord> {
        self.queue.clear();
        self.tags.clear();
        self.total_size = 0;
        self.records.drain().map(|(_, record)| record).collect()
    }
}

enum Lookup {
    Miss,
    Expired(IndexRecord),
    Found(String),
}

/// L2 Cache - durable warm cache
pub struct L2Cache<V> {
    state: Mutex<L2State>,
    backend: Arc<dyn StorageBackend>,
    codec: FrameCodec,
    config: L2Config,
    max_size_bytes: u64,
    index_name: String,
    persist_lock: tokio::sync::Mutex<()>,
    /// Serialize write and removal of one blob name
    blob_locks: Vec<tokio::sync::Mutex<()>>,
    /// A mutation happened since the last full snapshot
    dirty: AtomicBool,
    /// Access metadata changed since the last full snapshot
    touched: AtomicBool,
    counters: TierCounters,
    _value: PhantomData<fn() -> V>,
}

impl<V: CacheValue> L2Cache<V> {
    /// Open the configured backend and load (or rebuild) the index
    pub async fn open(config: L2Config) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match config.backend {
            L2BackendKind::Disk => Arc::new(DiskBackend::open(&config.disk_path).await?),
            L2BackendKind::Memory => Arc::new(InMemoryBackend::new()),
        };
        Self::with_backend(config, backend).await
    }

    /// Create over an existing backend
    pub async fn with_backend(config: L2Config, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;

        let codec = FrameCodec::new(if config.compression {
            CompressionConfig::default()
        } else {
            CompressionConfig::disabled()
        });

        let cache = Self {
            state: Mutex::new(L2State::default()),
            codec,
            max_size_bytes: config.max_size_bytes(),
            index_name: format!("index-{}.json", config.namespace),
            config,
            backend,
            persist_lock: tokio::sync::Mutex::new(()),
            blob_locks: (0..BLOB_LOCK_STRIPES)
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
            dirty: AtomicBool::new(false),
            touched: AtomicBool::new(false),
            counters: TierCounters::new(),
            _value: PhantomData,
        };
        cache.load_index().await?;
        Ok(cache)
    }

    /// Blob name for a key
    pub fn file_name(&self, key: &str) -> String {
        let mut scoped = Vec::with_capacity(self.config.namespace.len() + key.len() + 1);
        scoped.extend_from_slice(self.config.namespace.as_bytes());
        scoped.push(0);
        scoped.extend_from_slice(key.as_bytes());
        format!("{:016x}{}", fx_hash(&scoped), CONTENT_SUFFIX)
    }

    // -------------------------------------------------------------------------
    // Index persistence
    // -------------------------------------------------------------------------

    async fn load_index(&self) -> Result<()> {
        let loaded = match self.backend.read(&self.index_name).await? {
            Some(data) => match serde_json::from_slice::<IndexFile>(&data) {
                Ok(file)
                    if file.version != INDEX_VERSION
                        || file.namespace != self.config.namespace =>
                {
                    warn!(
                        namespace = %self.config.namespace,
                        version = file.version,
                        "L2 index sidecar does not match, rebuilding"
                    );
                    None
                }
                Ok(file) if !file.clean => {
                    info!(
                        namespace = %self.config.namespace,
                        "L2 index was not flushed before exit, rebuilding"
                    );
                    None
                }
                Ok(file) => Some(file.records),
                Err(e) => {
                    warn!(
                        namespace = %self.config.namespace,
                        error = %e,
                        "L2 index sidecar unreadable, rebuilding"
                    );
                    None
                }
            },
            None => None,
        };

        let rebuilt = loaded.is_none();
        let records = match loaded {
            Some(records) => records,
            None => self.scan_records().await?,
        };

        let now = Utc::now();
        let (expired, mut live): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| record.is_expired_at(now));
        live.sort_by_key(|record| record.accessed_at);

        let evicted = {
            let mut state = self.state.lock();
            for mut record in live {
                record.touch = next_touch();
                state.insert(record);
            }
            self.evict_over_capacity(&mut state)
        };

        if !expired.is_empty() {
            self.counters.record_expirations(expired.len() as u64);
        }
        for record in expired.iter().chain(evicted.iter()) {
            self.release_blob_quietly(record).await;
        }

        if rebuilt || !expired.is_empty() || !evicted.is_empty() {
            self.persist_index().await?;
        }

        info!(
            namespace = %self.config.namespace,
            backend = %self.backend.describe(),
            entries = self.len(),
            rebuilt,
            "L2 index loaded"
        );
        Ok(())
    }

    /// Rebuild index records from the content blobs of this namespace
    async fn scan_records(&self) -> Result<Vec<IndexRecord>> {
        let mut records = Vec::new();
        for name in self.backend.list().await? {
            if !name.ends_with(CONTENT_SUFFIX) {
                continue;
            }
            let Some(data) = self.backend.read(&name).await? else {
                continue;
            };
            let header = FrameCodec::decode(&data).and_then(|body| {
                serde_json::from_slice::<StoredHeader>(&body).map_err(Error::from)
            });
            match header {
                Ok(header) if header.namespace == self.config.namespace => {
                    records.push(IndexRecord {
                        file: name,
                        key: header.key,
                        size: data.len() as u64,
                        created_at: header.created_at,
                        accessed_at: header.created_at,
                        expires_at: header.expires_at,
                        access_count: 0,
                        tags: header.tags,
                        touch: 0,
                    });
                }
                Ok(_) => {}
                Err(e) => debug!(file = %name, error = %e, "Skipping unreadable blob"),
            }
        }
        Ok(records)
    }

    /// Write a full, clean snapshot of the index
    async fn persist_index(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        // Cleared before the snapshot; a later mutation marks it again
        self.dirty.store(false, Ordering::SeqCst);
        self.touched.store(false, Ordering::SeqCst);

        let snapshot = IndexFile {
            version: INDEX_VERSION,
            namespace: self.config.namespace.clone(),
            clean: true,
            records: self.state.lock().records.values().cloned().collect(),
        };
        let written = match serde_json::to_vec(&snapshot) {
            Ok(data) => self.backend.write(&self.index_name, Bytes::from(data)).await,
            Err(e) => Err(e.into()),
        };
        if written.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        written
    }

    /// Flag the sidecar as stale on storage.
    ///
    /// Only the first mutation after a flush writes anything: a small
    /// marker that makes the next `open` rebuild by scanning if the process
    /// stops before flushing.
    async fn mark_dirty(&self) -> Result<()> {
        if self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.persist_lock.lock().await;
        if self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        let marker = IndexFile {
            version: INDEX_VERSION,
            namespace: self.config.namespace.clone(),
            clean: false,
            records: Vec::new(),
        };
        let data = serde_json::to_vec(&marker)?;
        self.backend.write(&self.index_name, Bytes::from(data)).await?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Read paths must not fail because the marker could not be written
    async fn mark_dirty_quietly(&self) {
        if let Err(e) = self.mark_dirty().await {
            self.counters.record_error();
            warn!(namespace = %self.config.namespace, error = %e, "Failed to mark L2 index stale");
        }
    }

    /// Write the index sidecar, including read-side access metadata
    pub async fn flush(&self) -> Result<()> {
        self.persist_index().await
    }

    /// Flush only when something changed since the last flush; true if written
    pub async fn flush_if_needed(&self) -> Result<bool> {
        if !self.needs_flush() {
            return Ok(false);
        }
        self.persist_index().await?;
        Ok(true)
    }

    /// Whether the sidecar lags behind the in-memory index
    pub fn needs_flush(&self) -> bool {
        self.dirty.load(Ordering::SeqCst) || self.touched.load(Ordering::SeqCst)
    }

    fn blob_lock(&self, file: &str) -> &tokio::sync::Mutex<()> {
        let stripe = fx_hash(file.as_bytes()) as usize % self.blob_locks.len();
        &self.blob_locks[stripe]
    }

    /// Remove the blob of a dropped record, unless a newer write for the
    /// same key has indexed it again
    async fn release_blob(&self, record: &IndexRecord) -> Result<()> {
        let _blob = self.blob_lock(&record.file).lock().await;
        let reindexed = self
            .state
            .lock()
            .records
            .get(&record.key)
            .is_some_and(|current| current.file == record.file);
        if reindexed {
            debug!(key = %record.key, "L2 blob rewritten concurrently, keeping it");
            return Ok(());
        }
        self.backend.remove(&record.file).await?;
        Ok(())
    }

    async fn release_blob_quietly(&self, record: &IndexRecord) {
        if let Err(e) = self.release_blob(record).await {
            self.counters.record_error();
            warn!(file = %record.file, error = %e, "Failed to remove L2 blob");
        }
    }

    /// Pop LRU records until the size bound holds
    fn evict_over_capacity(&self, state: &mut L2State) -> Vec<IndexRecord> {
        let mut evicted = Vec::new();
        while state.total_size > self.max_size_bytes {
            let Some(victim) = state.queue.pop() else {
                break;
            };
            if let Some(record) = state.remove(&victim) {
                debug!(key = %record.key, size = record.size, "L2 eviction");
                evicted.push(record);
            }
        }
        if !evicted.is_empty() {
            self.counters.record_evictions(evicted.len() as u64);
        }
        evicted
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Get a value from the cache
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value))
    }

    /// Get a value with its metadata (expiry and tags survive promotion)
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        let lookup = {
            let mut state = self.state.lock();
            match state.records.get(key) {
                None => Lookup::Miss,
                Some(record) if record.is_expired_at(Utc::now()) => {
                    state.remove(key).map_or(Lookup::Miss, Lookup::Expired)
                }
                Some(record) => Lookup::Found(record.file.clone()),
            }
        };

        let file = match lookup {
            Lookup::Miss => {
                self.counters.record_miss();
                return Ok(None);
            }
            Lookup::Expired(record) => {
                self.counters.record_expirations(1);
                debug!(key, "L2 entry expired");
                self.mark_dirty_quietly().await;
                self.release_blob_quietly(&record).await;
                return Ok(None);
            }
            Lookup::Found(file) => file,
        };

        let data = match self.backend.read(&file).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                warn!(key, file = %file, "L2 blob missing, dropping index record");
                self.counters.record_error();
                self.drop_record(key, &file).await;
                return Ok(None);
            }
            Err(e) => {
                self.counters.record_error();
                return Err(e);
            }
        };

        let stored = match self.decode(&data) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(key, file = %file, error = %e, "L2 payload unreadable, dropping entry");
                self.counters.record_error();
                if let Some(record) = self.drop_record(key, &file).await {
                    self.release_blob_quietly(&record).await;
                }
                return Ok(None);
            }
        };

        if stored.namespace != self.config.namespace || stored.key != key {
            // Another key hashed to the same blob name and replaced it
            debug!(key, stored_key = %stored.key, "L2 blob holds a different key");
            self.counters.record_miss();
            self.drop_record(key, &file).await;
            return Ok(None);
        }

        {
            let mut state = self.state.lock();
            if let Some(record) = state.records.get_mut(key) {
                record.access_count += 1;
                record.accessed_at = Utc::now();
                record.touch = next_touch();
                let touch = record.touch;
                state.queue.upsert(key, (0, touch));
            }
        }
        self.touched.store(true, Ordering::SeqCst);
        self.counters.record_hit();

        Ok(Some(CacheEntry::with_expiry(
            key,
            stored.value,
            stored.created_at,
            stored.expires_at,
            stored.tags,
            data.len() as u64,
        )))
    }

    fn decode(&self, data: &[u8]) -> Result<StoredRecord<V>> {
        let body = FrameCodec::decode(data)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Remove the record if it still points at `file`
    async fn drop_record(&self, key: &str, file: &str) -> Option<IndexRecord> {
        let removed = {
            let mut state = self.state.lock();
            match state.records.get(key) {
                Some(record) if record.file == file => state.remove(key),
                _ => None,
            }
        };
        if removed.is_some() {
            self.mark_dirty_quietly().await;
        }
        removed
    }

    /// Insert or replace a value
    ///
    /// `ttl = None` falls back to the configured default TTL; a zero TTL
    /// removes any existing entry and stores nothing.
    pub async fn set(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<()> {
        let ttl = ttl.or(self.config.default_ttl);
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            self.delete(key).await?;
            return Ok(());
        }

        let now = Utc::now();
        let stored = StoredRecord {
            namespace: self.config.namespace.clone(),
            key: key.to_string(),
            created_at: now,
            expires_at: expiry_from(now, ttl),
            tags: tags.iter().cloned().collect::<BTreeSet<_>>(),
            value,
        };
        let json = serde_json::to_vec(&stored)?;
        let frame = self.codec.encode(&json);
        let size = frame.len() as u64;
        let file = self.file_name(key);

        // A crash after the blob write must not leave a clean sidecar
        // that misses it
        if let Err(e) = self.mark_dirty().await {
            self.counters.record_error();
            return Err(e);
        }

        let evicted = {
            let _blob = self.blob_lock(&file).lock().await;
            if let Err(e) = self.backend.write(&file, frame).await {
                self.counters.record_error();
                warn!(key, file = %file, error = %e, "L2 write failed");
                return Err(e);
            }

            let record = IndexRecord {
                file,
                key: key.to_string(),
                size,
                created_at: now,
                accessed_at: now,
                expires_at: stored.expires_at,
                access_count: 0,
                tags: stored.tags,
                touch: next_touch(),
            };
            let mut state = self.state.lock();
            state.insert(record);
            self.evict_over_capacity(&mut state)
        };

        // A flush may have snapshotted before the insert
        self.mark_dirty().await?;
        for record in &evicted {
            self.release_blob_quietly(record).await;
        }
        Ok(())
    }

    /// Remove an entry; true if it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.state.lock().remove(key);
        let Some(record) = removed else {
            return Ok(false);
        };
        self.mark_dirty().await?;
        self.release_blob(&record).await?;
        Ok(true)
    }

    /// Remove every entry carrying `tag`, returning the removed keys
    pub async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let removed: Vec<IndexRecord> = {
            let mut state = self.state.lock();
            let keys: Vec<String> = state
                .tags
                .get(tag)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default();
            keys.iter().filter_map(|key| state.remove(key)).collect()
        };
        if removed.is_empty() {
            return Ok(Vec::new());
        }
        self.mark_dirty().await?;
        for record in &removed {
            self.release_blob(record).await?;
        }
        Ok(removed.into_iter().map(|record| record.key).collect())
    }

    /// Active expiry sweep; returns the number of entries removed
    pub async fn purge_expired(&self) -> Result<usize> {
        let expired: Vec<IndexRecord> = {
            let mut state = self.state.lock();
            let now = Utc::now();
            let keys: Vec<String> = state
                .records
                .values()
                .filter(|record| record.is_expired_at(now))
                .map(|record| record.key.clone())
                .collect();
            keys.iter().filter_map(|key| state.remove(key)).collect()
        };
        if expired.is_empty() {
            return Ok(0);
        }
        self.counters.record_expirations(expired.len() as u64);
        self.mark_dirty().await?;
        for record in &expired {
            self.release_blob_quietly(record).await;
        }
        Ok(expired.len())
    }

    /// Remove this namespace's blobs and sidecar
    pub async fn clear(&self) -> Result<()> {
        let records = self.state.lock().take_all();
        self.mark_dirty().await?;
        for record in &records {
            self.release_blob(record).await?;
        }
        let _guard = self.persist_lock.lock().await;
        self.backend.remove(&self.index_name).await?;
        info!(namespace = %self.config.namespace, removed = records.len(), "L2 cleared");
        Ok(())
    }

    /// Check presence of a live entry without reading its blob
    pub fn contains(&self, key: &str) -> bool {
        self.state
            .lock()
            .records
            .get(key)
            .is_some_and(|record| !record.is_expired_at(Utc::now()))
    }

    /// Copy of the index (expired-but-unswept records included)
    pub fn records(&self) -> Vec<IndexRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored bytes
    pub fn size(&self) -> u64 {
        self.state.lock().total_size
    }

    /// Cache namespace
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Get configuration
    pub fn config(&self) -> &L2Config {
        &self.config
    }

    /// Underlying storage
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatistics {
        let (entries, size) = {
            let state = self.state.lock();
            (state.records.len() as u64, state.total_size)
        };
        self.counters.snapshot(entries, size)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::faulty::FaultyBackend;
    use assert_matches::assert_matches;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn disk_config(dir: &TempDir, namespace: &str) -> L2Config {
        L2Config {
            disk_path: dir.path().to_path_buf(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    async fn open(dir: &TempDir, namespace: &str) -> L2Cache<Value> {
        L2Cache::open(disk_config(dir, namespace)).await.unwrap()
    }

    fn memory_config() -> L2Config {
        L2Config {
            backend: L2BackendKind::Memory,
            compression: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, "test").await;

        cache.set("key1", &json!({"data": "value1"}), None, &[]).await.unwrap();
        assert_eq!(cache.get("key1").await.unwrap(), Some(json!({"data": "value1"})));
        assert!(cache.contains("key1"));

        assert!(cache.get("missing").await.unwrap().is_none());

        assert!(cache.delete("key1").await.unwrap());
        assert!(!cache.delete("key1").await.unwrap());
        assert!(cache.get("key1").await.unwrap().is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = open(&dir, "test").await;
            let tags = vec!["deck".to_string()];
            cache.set("persist", &json!([1, 2, 3]), None, &tags).await.unwrap();
        }

        let cache = open(&dir, "test").await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("persist").await.unwrap(), Some(json!([1, 2, 3])));
        assert_eq!(cache.delete_by_tag("deck").await.unwrap(), vec!["persist".to_string()]);
    }

    #[tokio::test]
    async fn test_index_rebuilt_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = open(&dir, "test").await;
            let tags = vec!["t".to_string()];
            cache.set("a", &json!("A"), None, &tags).await.unwrap();
            cache.set("b", &json!("B"), None, &[]).await.unwrap();
        }
        std::fs::remove_file(dir.path().join("index-test.json")).unwrap();

        let cache = open(&dir, "test").await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").await.unwrap(), Some(json!("A")));
        assert_eq!(cache.delete_by_tag("t").await.unwrap(), vec!["a".to_string()]);
        assert!(dir.path().join("index-test.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_sidecar_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = open(&dir, "test").await;
            cache.set("a", &json!(1), None, &[]).await.unwrap();
        }
        std::fs::write(dir.path().join("index-test.json"), b"{not json").unwrap();

        let cache = open(&dir, "test").await;
        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_compression_shrinks_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, "test").await;

        let value = json!({"text": "x".repeat(10_000)});
        cache.set("large", &value, None, &[]).await.unwrap();

        let blob = dir.path().join(cache.file_name("large"));
        assert!(std::fs::metadata(&blob).unwrap().len() < 5000);
        assert_eq!(cache.get("large").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_uncompressed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = L2Config {
            compression: false,
            ..disk_config(&dir, "plain")
        };
        let cache: L2Cache<Value> = L2Cache::open(config).await.unwrap();

        let value = json!({"text": "y".repeat(5_000)});
        cache.set("k", &value, None, &[]).await.unwrap();

        let blob = dir.path().join(cache.file_name("k"));
        assert!(std::fs::metadata(&blob).unwrap().len() > 5000);
        assert_eq!(cache.get("k").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let app1 = open(&dir, "app1").await;
        let app2 = open(&dir, "app2").await;

        app1.set("key", &json!("app1_value"), None, &[]).await.unwrap();
        app2.set("key", &json!("app2_value"), None, &[]).await.unwrap();

        assert_ne!(app1.file_name("key"), app2.file_name("key"));
        assert_eq!(app1.get("key").await.unwrap(), Some(json!("app1_value")));
        assert_eq!(app2.get("key").await.unwrap(), Some(json!("app2_value")));

        app1.clear().await.unwrap();
        assert!(app1.get("key").await.unwrap().is_none());
        assert_eq!(app2.get("key").await.unwrap(), Some(json!("app2_value")));

        // A rebuild only picks up its own namespace
        std::fs::remove_file(dir.path().join("index-app2.json")).unwrap();
        drop(app2);
        let app2 = open(&dir, "app2").await;
        assert_eq!(app2.len(), 1);
    }

    #[tokio::test]
    async fn test_size_limit_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let config = L2Config {
            max_size_mb: 1000.0 / MIB,
            ..disk_config(&dir, "small")
        };
        let cache: L2Cache<Value> = L2Cache::open(config).await.unwrap();

        for i in 0..10 {
            let value = json!("v".repeat(200));
            cache.set(&format!("key{}", i), &value, None, &[]).await.unwrap();
        }

        let stats = cache.stats();
        assert!(stats.evictions > 0);
        assert!(stats.total_size_bytes <= 1000);
        assert!(cache.contains("key9"));
        assert!(!cache.contains("key0"));
        assert!(!dir.path().join(cache.file_name("key0")).exists());
    }

    #[tokio::test]
    async fn test_corrupt_payload_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, "test").await;
        cache.set("bad", &json!("fine"), None, &[]).await.unwrap();

        std::fs::write(dir.path().join(cache.file_name("bad")), b"garbage-bytes").unwrap();

        assert!(cache.get("bad").await.unwrap().is_none());
        let stats = cache.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.entry_count, 0);

        // The next miss is an ordinary one
        assert!(cache.get("bad").await.unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_missing_blob_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, "test").await;
        cache.set("gone", &json!(1), None, &[]).await.unwrap();

        std::fs::remove_file(dir.path().join(cache.file_name("gone"))).unwrap();

        assert!(cache.get("gone").await.unwrap().is_none());
        assert_eq!(cache.stats().errors, 1);
        assert!(!cache.contains("gone"));
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let config = L2Config {
            backend: L2BackendKind::Memory,
            ..Default::default()
        };
        let cache: L2Cache<String> = L2Cache::with_backend(config, backend).await.unwrap();

        cache
            .set("short", &"s".to_string(), Some(Duration::from_millis(50)), &[])
            .await
            .unwrap();
        cache
            .set("other", &"o".to_string(), Some(Duration::from_millis(50)), &[])
            .await
            .unwrap();
        assert_eq!(cache.get("short").await.unwrap().as_deref(), Some("s"));

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.get("short").await.unwrap().is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.stats().expirations, 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_expired_records_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = open(&dir, "test").await;
            cache
                .set("short", &json!(1), Some(Duration::from_millis(20)), &[])
                .await
                .unwrap();
            cache.set("long", &json!(2), None, &[]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cache = open(&dir, "test").await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 1);
        assert!(!dir.path().join(cache.file_name("short")).exists());
    }

    #[tokio::test]
    async fn test_promotion_entry_keeps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, "test").await;
        let tags = vec!["a".to_string(), "b".to_string()];
        cache
            .set("k", &json!(7), Some(Duration::from_secs(60)), &tags)
            .await
            .unwrap();

        let entry = cache.get_entry("k").await.unwrap().unwrap();
        assert_eq!(entry.value, json!(7));
        assert!(entry.expires_at.is_some());
        assert!(entry.has_tag("a") && entry.has_tag("b"));
    }

    #[tokio::test]
    async fn test_zero_ttl_removes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, "test").await;
        cache.set("k", &json!(1), None, &[]).await.unwrap();
        cache.set("k", &json!(2), Some(Duration::ZERO), &[]).await.unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(L2Config::default().validate().is_ok());

        let bad = L2Config {
            namespace: "../escape".into(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let empty = L2Config {
            namespace: String::new(),
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }

    #[tokio::test]
    async fn test_set_writes_stay_linear() {
        let backend = Arc::new(InMemoryBackend::new());
        let cache: L2Cache<Value> = L2Cache::with_backend(memory_config(), backend.clone())
            .await
            .unwrap();
        let before = backend.stats();

        for i in 0..500 {
            cache
                .set(&format!("card:{}", i), &json!({"n": i}), None, &[])
                .await
                .unwrap();
        }

        // One blob per set and a single stale marker for the index
        let after = backend.stats();
        assert_eq!(after.writes - before.writes, 501);
        assert!(after.bytes_written - before.bytes_written < cache.size() + 256);
        assert!(cache.needs_flush());

        cache.flush().await.unwrap();
        assert!(!cache.needs_flush());
        assert_eq!(backend.stats().writes, after.writes + 1);
    }

    #[tokio::test]
    async fn test_flush_keeps_access_metadata() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        {
            let cache: L2Cache<Value> = L2Cache::with_backend(memory_config(), backend.clone())
                .await
                .unwrap();
            cache.set("a", &json!(1), None, &[]).await.unwrap();
            cache.get("a").await.unwrap();
            cache.get("a").await.unwrap();
            assert!(cache.flush_if_needed().await.unwrap());
            assert!(!cache.flush_if_needed().await.unwrap());
        }

        let cache: L2Cache<Value> = L2Cache::with_backend(memory_config(), backend)
            .await
            .unwrap();
        assert_eq!(cache.records()[0].access_count, 2);
        assert!(!cache.needs_flush());
    }

    #[tokio::test]
    async fn test_unflushed_index_is_rebuilt() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        {
            let cache: L2Cache<Value> = L2Cache::with_backend(memory_config(), backend.clone())
                .await
                .unwrap();
            cache.set("a", &json!(1), None, &[]).await.unwrap();
            cache.get("a").await.unwrap();
        }

        let cache: L2Cache<Value> = L2Cache::with_backend(memory_config(), backend)
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
        // Rebuilt from the blob header, so read counts start over
        assert_eq!(cache.records()[0].access_count, 0);
        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
        assert!(cache.needs_flush());
    }

    #[tokio::test]
    async fn test_failed_blob_write_leaves_index() {
        let backend = Arc::new(FaultyBackend::new());
        let cache: L2Cache<Value> = L2Cache::with_backend(memory_config(), backend.clone())
            .await
            .unwrap();
        cache.set("a", &json!("old"), None, &[]).await.unwrap();

        backend.fail_blob_writes(true);
        assert_matches!(cache.set("a", &json!("new"), None, &[]).await, Err(Error::Io(_)));
        assert_matches!(cache.set("b", &json!(1), None, &[]).await, Err(Error::Io(_)));
        assert_eq!(cache.stats().errors, 2);
        assert!(!cache.contains("b"));
        assert_eq!(cache.get("a").await.unwrap(), Some(json!("old")));

        backend.fail_blob_writes(false);
        cache.set("b", &json!(1), None, &[]).await.unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_blob_read_error_propagates() {
        let backend = Arc::new(FaultyBackend::new());
        let cache: L2Cache<Value> = L2Cache::with_backend(memory_config(), backend.clone())
            .await
            .unwrap();
        cache.set("a", &json!(1), None, &[]).await.unwrap();

        backend.fail_blob_reads(true);
        assert_matches!(cache.get("a").await, Err(Error::Io(_)));
        assert_eq!(cache.stats().errors, 1);
        // A transient read error keeps the record
        assert!(cache.contains("a"));

        backend.fail_blob_reads(false);
        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_delete_racing_set_keeps_new_blob() {
        let backend = Arc::new(FaultyBackend::new());
        let cache: Arc<L2Cache<Value>> = Arc::new(
            L2Cache::with_backend(memory_config(), backend.clone())
                .await
                .unwrap(),
        );
        cache.set("k", &json!(1), None, &[]).await.unwrap();

        backend.delay_removes(Some(Duration::from_millis(100)));
        let deleter = tokio::spawn({
            let cache = cache.clone();
            async move { cache.delete("k").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.set("k", &json!(2), None, &[]).await.unwrap();
        assert!(deleter.await.unwrap().unwrap());
        backend.delay_removes(None);

        assert_eq!(cache.get("k").await.unwrap(), Some(json!(2)));
        assert_eq!(cache.stats().errors, 0);
    }
}
