//! Cache Manager - Unified Two-Tier Cache
//!
//! Orchestrates L1 (RAM) and L2 (disk): read-through with promotion,
//! write to both tiers, epoch invalidation through versioned keys, per-key
//! single-flight for computed values, refresh-ahead and an expiry sweeper.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::entry::{estimate_size, CacheEntry, CacheValue};
use super::l1::L1Cache;
use super::l2::L2Cache;
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::stats::CacheStatistics;
use super::MIN_REFRESH_INTERVAL;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Caching posture recorded in configuration and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Fill on read miss through a compute function
    #[default]
    CacheAside,
    /// Writes go to every tier immediately
    WriteThrough,
    /// Hot keys are recomputed before they expire
    RefreshAhead,
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStrategy::CacheAside => write!(f, "cache_aside"),
            CacheStrategy::WriteThrough => write!(f, "write_through"),
            CacheStrategy::RefreshAhead => write!(f, "refresh_ahead"),
        }
    }
}

/// Manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Use the durable tier
    pub enable_l2: bool,
    /// Caching posture
    pub strategy: CacheStrategy,
    /// Coalesce concurrent computations of one key
    pub stampede_protection: bool,
    /// Initial key version
    pub version: u64,
    /// Run the expiry sweeper at this period
    #[serde(with = "crate::config::opt_duration")]
    pub sweep_interval: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enable_l2: true,
            strategy: CacheStrategy::CacheAside,
            stampede_protection: true,
            version: 1,
            sweep_interval: None,
        }
    }
}

/// Manager statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerStatistics {
    pub l1: CacheStatistics,
    /// All zero when the durable tier is disabled
    pub l2: CacheStatistics,
    pub l2_enabled: bool,
    /// Lookups answered by either tier over all manager lookups
    pub overall_hit_rate: f64,
    pub version: u64,
    pub strategy: CacheStrategy,
    pub refresh_tasks: usize,
    pub metrics: MetricsSnapshot,
}

/// Outcome of [`CacheManager::warm_cache`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmReport {
    pub requested: usize,
    /// Computed and stored
    pub warmed: usize,
    /// Already present, left untouched
    pub already_cached: usize,
    /// Keys whose computation failed
    pub failed: Vec<String>,
}

/// Outcome of [`CacheManager::purge_expired`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub l1: usize,
    pub l2: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.l1 + self.l2
    }
}

/// Why a shared computation produced no value
#[derive(Clone)]
enum ComputeFailure {
    Compute(Arc<anyhow::Error>),
    Store(Arc<Error>),
}

impl ComputeFailure {
    fn into_error(self, key: &str) -> Error {
        match self {
            ComputeFailure::Compute(reason) => Error::Compute {
                key: key.to_string(),
                reason,
            },
            ComputeFailure::Store(source) => Error::Store {
                key: key.to_string(),
                source,
            },
        }
    }
}

type ComputeResult<V> = std::result::Result<V, ComputeFailure>;
type SharedCompute<V> = Shared<BoxFuture<'static, ComputeResult<V>>>;

/// Releases a key's in-flight slot when its computation ends, however it ends
struct InFlightSlot<V: CacheValue> {
    inner: Weak<Inner<V>>,
    key: String,
}

impl<V: CacheValue> Drop for InFlightSlot<V> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.in_flight.lock().remove(&self.key);
        }
    }
}

/// Spawned loop plus the token that stops it
struct BackgroundTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    fn cancel(&self) {
        self.token.cancel();
    }
}

enum WarmOutcome {
    Warmed,
    Cached,
    Failed(String),
}

struct Inner<V> {
    l1: L1Cache<V>,
    l2: Option<L2Cache<V>>,
    config: ManagerConfig,
    version: AtomicU64,
    in_flight: Mutex<HashMap<String, SharedCompute<V>>>,
    refresh_tasks: Mutex<HashMap<String, BackgroundTask>>,
    sweeper: Mutex<Option<BackgroundTask>>,
    metrics: CacheMetrics,
    shutdown: CancellationToken,
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<V: CacheValue> Inner<V> {
    /// L1, then L2 with promotion
    async fn lookup(&self, versioned_key: &str) -> Result<Option<V>> {
        if let Some(value) = self.l1.get(versioned_key) {
            debug!(key = versioned_key, "L1 hit");
            return Ok(Some(value));
        }

        let Some(l2) = &self.l2 else {
            return Ok(None);
        };
        match l2.get_entry(versioned_key).await? {
            Some(entry) => {
                debug!(key = versioned_key, "L2 hit, promoting");
                let value = entry.value.clone();
                self.promote(entry);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Copy an L2 entry into L1 with the same expiry and tags
    fn promote(&self, entry: CacheEntry<V>) {
        let size = estimate_size(&entry.value);
        let promoted = CacheEntry::with_expiry(
            entry.key,
            entry.value,
            entry.created_at,
            entry.expires_at,
            entry.tags,
            size,
        );
        self.l1.put_entry(promoted);
        self.metrics.record_promotion_l2_to_l1();
    }

    async fn store(
        &self,
        versioned_key: &str,
        value: &V,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<()> {
        self.l1.set(versioned_key, value.clone(), ttl, tags);
        if let Some(l2) = &self.l2 {
            l2.set(versioned_key, value, ttl, tags).await?;
        }
        Ok(())
    }

    /// Body of a single-flight computation
    async fn run_compute<Fut>(
        inner: Weak<Self>,
        versioned_key: String,
        compute: Fut,
        ttl: Option<Duration>,
        slot: Option<InFlightSlot<V>>,
    ) -> ComputeResult<V>
    where
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let _slot = slot;
        let tracker = LatencyTracker::start();
        let outcome = compute.await;

        let Some(inner) = inner.upgrade() else {
            return outcome.map_err(|e| ComputeFailure::Compute(Arc::new(e)));
        };

        match outcome {
            Ok(value) => {
                inner.metrics.record_computation(tracker.elapsed());
                match inner.store(&versioned_key, &value, ttl, &[]).await {
                    Ok(()) => Ok(value),
                    Err(e) => {
                        warn!(key = %versioned_key, error = %e, "Failed to store computed value");
                        Err(ComputeFailure::Store(Arc::new(e)))
                    }
                }
            }
            Err(e) => {
                inner.metrics.record_compute_failure();
                warn!(key = %versioned_key, error = %e, "Compute function failed");
                Err(ComputeFailure::Compute(Arc::new(e)))
            }
        }
    }

    /// Run a computation on its own task so it completes, and frees its
    /// slot, even when every caller stops waiting
    fn spawn_compute<Fut>(
        self: &Arc<Self>,
        versioned_key: String,
        compute: Fut,
        ttl: Option<Duration>,
        tracked: bool,
    ) -> SharedCompute<V>
    where
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let slot = tracked.then(|| InFlightSlot {
            inner: weak.clone(),
            key: versioned_key.clone(),
        });
        let handle = tokio::spawn(Self::run_compute(
            weak,
            versioned_key.clone(),
            compute,
            ttl,
            slot,
        ));
        async move {
            handle.await.unwrap_or_else(|e| {
                Err(ComputeFailure::Compute(Arc::new(anyhow::anyhow!(
                    "computation for {} did not finish: {}",
                    versioned_key,
                    e
                ))))
            })
        }
        .boxed()
        .shared()
    }
}

/// Unified cache manager
///
/// Cheap to clone; clones share the tiers and background tasks.
pub struct CacheManager<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheManager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> CacheManager<V> {
    /// Build both tiers from configuration
    pub async fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let l1 = L1Cache::with_config(config.l1.clone());
        let l2 = if config.manager.enable_l2 {
            Some(L2Cache::open(config.l2.clone()).await?)
        } else {
            None
        };

        let manager = Self::from_tiers(l1, l2, config.manager.clone());
        if let Some(interval) = config.manager.sweep_interval {
            manager.start_expiry_sweeper(interval);
        }

        info!(
            l2 = config.manager.enable_l2,
            strategy = %config.manager.strategy,
            policy = %config.l1.eviction_policy,
            "Cache manager started"
        );
        Ok(manager)
    }

    /// Assemble from prepared tiers
    pub fn from_tiers(l1: L1Cache<V>, l2: Option<L2Cache<V>>, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                l1,
                l2,
                version: AtomicU64::new(config.version),
                config,
                in_flight: Mutex::new(HashMap::new()),
                refresh_tasks: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
                metrics: CacheMetrics::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Key as stored in the tiers under the current version
    pub fn versioned_key(&self, key: &str) -> String {
        format!("v{}:{}", self.version(), key)
    }

    /// Get a value from the cache (L1, then L2 with promotion)
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        let tracker = LatencyTracker::start();
        let result = self.inner.lookup(&self.versioned_key(key)).await;
        self.inner.metrics.record_get_latency(tracker.elapsed());
        result
    }

    /// Get a value, computing and storing it on a miss.
    ///
    /// With stampede protection, concurrent callers for one key share a
    /// single computation and all receive its value or its error. A failed
    /// computation is not cached; the next call computes again.
    #[instrument(level = "debug", skip(self, compute))]
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl: Option<Duration>,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let tracker = LatencyTracker::start();
        let versioned_key = self.versioned_key(key);
        let found = self.inner.lookup(&versioned_key).await;
        self.inner.metrics.record_get_latency(tracker.elapsed());
        match found {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "Cache lookup failed, computing"),
        }

        let shared = if self.inner.config.stampede_protection {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&versioned_key) {
                Some(existing) => {
                    self.inner.metrics.record_coalesced_wait();
                    debug!(key, "Joining in-flight computation");
                    existing.clone()
                }
                None => {
                    // Spawned under the map lock, so the slot is inserted
                    // before the task can release it
                    let task =
                        self.inner
                            .spawn_compute(versioned_key.clone(), compute(), ttl, true);
                    in_flight.insert(versioned_key, task.clone());
                    task
                }
            }
        } else {
            self.inner.spawn_compute(versioned_key, compute(), ttl, false)
        };

        shared.await.map_err(|failure| failure.into_error(key))
    }

    /// Store a value in every tier
    pub async fn set(
        &self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<()> {
        self.inner
            .store(&self.versioned_key(key), &value, ttl, tags)
            .await
    }

    /// Remove a key from every tier; true if any tier held it
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let versioned_key = self.versioned_key(key);
        let in_l1 = self.inner.l1.delete(&versioned_key);
        let in_l2 = match &self.inner.l2 {
            Some(l2) => l2.delete(&versioned_key).await?,
            None => false,
        };
        Ok(in_l1 || in_l2)
    }

    /// Whether a live entry exists in any tier (no statistics recorded)
    pub fn contains(&self, key: &str) -> bool {
        let versioned_key = self.versioned_key(key);
        self.inner.l1.contains(&versioned_key)
            || self
                .inner
                .l2
                .as_ref()
                .is_some_and(|l2| l2.contains(&versioned_key))
    }

    /// Empty every tier
    pub async fn clear(&self) -> Result<()> {
        self.inner.l1.clear();
        if let Some(l2) = &self.inner.l2 {
            l2.clear().await?;
        }
        info!("Cache cleared");
        Ok(())
    }

    /// Remove every entry carrying `tag` from both tiers.
    ///
    /// Returns the number of distinct keys removed.
    pub async fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        let mut removed: HashSet<String> = self.inner.l1.delete_by_tag(tag).into_iter().collect();
        if let Some(l2) = &self.inner.l2 {
            removed.extend(l2.delete_by_tag(tag).await?);
        }
        debug!(tag, removed = removed.len(), "Invalidated by tag");
        Ok(removed.len())
    }

    /// Precompute many keys with bounded concurrency.
    ///
    /// Keys already cached are skipped. A failing key is reported, not fatal.
    #[instrument(level = "debug", skip(self, keys, compute))]
    pub async fn warm_cache<I, F, Fut>(
        &self,
        keys: I,
        compute: F,
        ttl: Option<Duration>,
        batch_size: usize,
    ) -> Result<WarmReport>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if batch_size == 0 {
            return Err(Error::Config("warm_cache batch_size must be positive".into()));
        }

        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let compute = &compute;
        let outcomes: Vec<WarmOutcome> = stream::iter(keys)
            .map(|key| async move {
                if self.contains(&key) {
                    return WarmOutcome::Cached;
                }
                let pending = compute(key.clone());
                match self.get_or_compute(&key, move || pending, ttl).await {
                    Ok(_) => {
                        self.inner.metrics.record_warmed_key();
                        WarmOutcome::Warmed
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to warm key");
                        WarmOutcome::Failed(key)
                    }
                }
            })
            .buffer_unordered(batch_size)
            .collect()
            .await;

        let mut report = WarmReport {
            requested: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                WarmOutcome::Warmed => report.warmed += 1,
                WarmOutcome::Cached => report.already_cached += 1,
                WarmOutcome::Failed(key) => report.failed.push(key),
            }
        }
        report.failed.sort();

        info!(
            requested = report.requested,
            warmed = report.warmed,
            cached = report.already_cached,
            failed = report.failed.len(),
            "Cache warm-up finished"
        );
        Ok(report)
    }

    /// Store a value now and keep recomputing it before it expires.
    ///
    /// The first computation runs inline and its error is returned. Later
    /// cycles run every `ttl - refresh_before` (at least 10 ms); a failed
    /// cycle is logged and the loop continues. Registering a key again
    /// replaces its task.
    #[instrument(level = "debug", skip(self, compute))]
    pub async fn start_refresh_ahead<F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
        refresh_before: Duration,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let initial = compute().await.map_err(|e| Error::Compute {
            key: key.to_string(),
            reason: Arc::new(e),
        })?;
        self.set(key, initial, Some(ttl), &[]).await?;

        let period = ttl.saturating_sub(refresh_before).max(MIN_REFRESH_INTERVAL);
        let token = self.inner.shutdown.child_token();
        let task_token = token.clone();
        let weak = Arc::downgrade(&self.inner);
        let task_key = key.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = CacheManager { inner };
                manager.refresh_cycle(&task_key, &compute, ttl, &task_token).await;
            }
            debug!(key = %task_key, "Refresh-ahead task stopped");
        });

        let previous = self
            .inner
            .refresh_tasks
            .lock()
            .insert(key.to_string(), BackgroundTask { token, handle });
        if let Some(previous) = previous {
            previous.cancel();
        }

        info!(key, ?period, "Refresh-ahead registered");
        Ok(())
    }

    async fn refresh_cycle<F, Fut>(
        &self,
        key: &str,
        compute: &F,
        ttl: Duration,
        token: &CancellationToken,
    ) where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let value = match compute().await {
            Ok(value) => value,
            Err(e) => {
                self.inner.metrics.record_refresh_failure();
                warn!(key, error = %e, "Refresh-ahead cycle failed");
                return;
            }
        };
        if token.is_cancelled() {
            return;
        }
        match self.set(key, value, Some(ttl), &[]).await {
            Ok(()) => {
                self.inner.metrics.record_refresh_cycle();
                debug!(key, "Refreshed ahead of expiry");
            }
            Err(e) => {
                self.inner.metrics.record_refresh_failure();
                warn!(key, error = %e, "Failed to store refreshed value");
            }
        }
    }

    /// Stop refreshing a key; true if it was registered
    pub fn cancel_refresh_ahead(&self, key: &str) -> bool {
        match self.inner.refresh_tasks.lock().remove(key) {
            Some(task) => {
                task.cancel();
                debug!(key, "Refresh-ahead cancelled");
                true
            }
            None => false,
        }
    }

    /// Keys with a registered refresh-ahead task
    pub fn refresh_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.refresh_tasks.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Current key version
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Switch to another key version; entries of other versions become
    /// unreachable and age out through eviction or expiry
    pub fn set_version(&self, version: u64) {
        let previous = self.inner.version.swap(version, Ordering::SeqCst);
        info!(previous, version, "Cache version changed");
    }

    /// Invalidate everything by moving to the next version
    pub fn bump_version(&self) -> u64 {
        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(version, "Cache version bumped");
        version
    }

    /// Remove expired entries from both tiers
    pub async fn purge_expired(&self) -> Result<PurgeReport> {
        let mut report = PurgeReport {
            l1: self.inner.l1.purge_expired(),
            l2: 0,
        };
        if let Some(l2) = &self.inner.l2 {
            report.l2 = l2.purge_expired().await?;
        }
        if report.total() > 0 {
            self.inner.metrics.record_swept(report.total() as u64);
            debug!(l1 = report.l1, l2 = report.l2, "Purged expired entries");
        }
        Ok(report)
    }

    /// Run `purge_expired` every `interval`, replacing any running sweeper
    pub fn start_expiry_sweeper(&self, interval: Duration) {
        let token = self.inner.shutdown.child_token();
        let task_token = token.clone();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = CacheManager { inner };
                if let Err(e) = manager.purge_expired().await {
                    warn!(error = %e, "Expiry sweep failed");
                }
                if let Some(l2) = &manager.inner.l2 {
                    if let Err(e) = l2.flush_if_needed().await {
                        warn!(error = %e, "L2 index flush failed");
                    }
                }
            }
            debug!("Expiry sweeper stopped");
        });

        if let Some(previous) = self
            .inner
            .sweeper
            .lock()
            .replace(BackgroundTask { token, handle })
        {
            previous.cancel();
        }
        info!(?interval, "Expiry sweeper started");
    }

    /// Stop every background task and flush the L2 index
    pub async fn shutdown(&self) -> Result<()> {
        let mut tasks: Vec<BackgroundTask> = self
            .inner
            .refresh_tasks
            .lock()
            .drain()
            .map(|(_, task)| task)
            .collect();
        tasks.extend(self.inner.sweeper.lock().take());

        for task in &tasks {
            task.cancel();
        }
        for task in tasks {
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(l2) = &self.inner.l2 {
            l2.flush().await?;
        }
        info!("Cache manager stopped");
        Ok(())
    }

    /// Statistics for both tiers plus manager counters
    pub fn get_statistics(&self) -> ManagerStatistics {
        let l1 = self.inner.l1.stats();
        let l2 = self
            .inner
            .l2
            .as_ref()
            .map(|l2| l2.stats())
            .unwrap_or_default();

        let lookups = l1.hits + l1.misses + l1.expirations;
        let overall_hit_rate = if lookups == 0 {
            0.0
        } else {
            (l1.hits + l2.hits) as f64 / lookups as f64
        };

        ManagerStatistics {
            l1,
            l2,
            l2_enabled: self.inner.l2.is_some(),
            overall_hit_rate,
            version: self.version(),
            strategy: self.inner.config.strategy,
            refresh_tasks: self.inner.refresh_tasks.lock().len(),
            metrics: self.inner.metrics.snapshot(),
        }
    }

    /// The in-memory tier
    pub fn l1(&self) -> &L1Cache<V> {
        &self.inner.l1
    }

    /// The durable tier, if enabled
    pub fn l2(&self) -> Option<&L2Cache<V>> {
        self.inner.l2.as_ref()
    }

    /// Get configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }
}

// =============================================================================
// Tests
// =============================================================================
