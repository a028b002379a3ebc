//! Two-Tiered Cache System
//!
//! In-process L1 (RAM) in front of a durable L2 (disk), orchestrated by
//! [`CacheManager`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           Cache Manager                              │
//! │   versioned keys · single-flight · refresh-ahead · expiry sweeper    │
//! ├──────────────────────────────────┬───────────────────────────────────┤
//! │  L1 Cache (RAM)                  │  L2 Cache (Disk)                  │
//! │  ┌────────────────────────────┐  │  ┌─────────────────────────────┐  │
//! │  │ HashMap + EvictionQueue    │  │  │ Index + sidecar snapshot    │  │
//! │  │ LRU / LFU                  │  │  │ LRU, LZ4-framed JSON blobs  │  │
//! │  │ entry + memory bounds      │  │  │ size bound, namespaces      │  │
//! │  └────────────────────────────┘  │  └─────────────────────────────┘  │
//! │               ▲                  │                │                  │
//! │               └──── promotion ───┴────────────────┘                  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Tiers never call each other; only the manager moves entries
//! - Locks are never held across `.await`
//! - Misses (absent, expired, unreadable) are not errors

pub mod backend;
pub mod compression;
mod entry;
mod l1;
mod l2;
mod manager;
mod metrics;
mod policy;
mod stats;

pub use backend::{BackendStats, DiskBackend, InMemoryBackend, StorageBackend};
pub use compression::{BlockCodec, Codec, CompressionConfig, FrameCodec};
pub use entry::{estimate_size, CacheEntry, CacheValue};
pub use l1::{L1Cache, L1Config};
pub use l2::{IndexRecord, L2BackendKind, L2Cache, L2Config};
pub use manager::{
    CacheManager, CacheStrategy, ManagerConfig, ManagerStatistics, PurgeReport, WarmReport,
};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use policy::{EvictionPolicy, EvictionPolicyKind, EvictionQueue, LfuPolicy, LruPolicy};
pub use stats::{hit_rate, CacheStatistics};

/// Default L1 entry bound
pub const DEFAULT_L1_MAX_ENTRIES: usize = 1000;

/// Default L1 memory bound (MiB)
pub const DEFAULT_L1_MAX_MEMORY_MB: f64 = 100.0;

/// Default L2 size bound (MiB)
pub const DEFAULT_L2_MAX_SIZE_MB: f64 = 1024.0;

/// Default L2 namespace
pub const DEFAULT_NAMESPACE: &str = "default";

/// Shortest sleep between refresh-ahead cycles
pub const MIN_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);
