//! Cache Manager Metrics
//!
//! Orchestration-level counters: computations, single-flight joins,
//! promotions and background refresh activity. Tier hit/miss counters live
//! with the tiers themselves (see `stats`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Manager metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    computations: AtomicU64,
    compute_failures: AtomicU64,
    coalesced_waits: AtomicU64,
    promotions_l2_to_l1: AtomicU64,
    warmed_keys: AtomicU64,
    refresh_cycles: AtomicU64,
    refresh_failures: AtomicU64,
    swept_entries: AtomicU64,

    // Microseconds, exponential moving average
    get_latency_us: AtomicU64,
    compute_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_computation(&self, duration: Duration) {
        self.computations.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(&self.compute_latency_us, duration);
    }

    pub fn record_compute_failure(&self) {
        self.compute_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced_wait(&self) {
        self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion_l2_to_l1(&self) {
        self.promotions_l2_to_l1.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warmed_key(&self) {
        self.warmed_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_cycle(&self) {
        self.refresh_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swept(&self, count: u64) {
        self.swept_entries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_get_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.get_latency_us, duration);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    pub fn coalesced_waits(&self) -> u64 {
        self.coalesced_waits.load(Ordering::Relaxed)
    }

    pub fn get_latency(&self) -> Duration {
        Duration::from_micros(self.get_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            computations: self.computations(),
            compute_failures: self.compute_failures.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits(),
            promotions_l2_to_l1: self.promotions_l2_to_l1.load(Ordering::Relaxed),
            warmed_keys: self.warmed_keys.load(Ordering::Relaxed),
            refresh_cycles: self.refresh_cycles.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            swept_entries: self.swept_entries.load(Ordering::Relaxed),
            get_latency_us: self.get_latency_us.load(Ordering::Relaxed),
            compute_latency_us: self.compute_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of manager metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub computations: u64,
    pub compute_failures: u64,
    pub coalesced_waits: u64,
    pub promotions_l2_to_l1: u64,
    pub warmed_keys: u64,
    pub refresh_cycles: u64,
    pub refresh_failures: u64,
    pub swept_entries: u64,
    pub get_latency_us: u64,
    pub compute_latency_us: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
