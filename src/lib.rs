//! tiercache - Two-Tier Cache Engine
//!
//! An in-memory L1 tier in front of a durable L2 tier, coordinated by a
//! cache manager. Built for pipelines where values are expensive to produce
//! (generated flashcards, model responses) and many workers ask for the
//! same key at once.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ CacheManager ──▶ L1Cache (RAM, LRU/LFU)
//!                 │      └──▶ L2Cache (disk, LZ4, namespaces)
//!                 └──▶ compute fn (single-flight per key)
//! ```
//!
//! # Features
//!
//! - Entry-count and byte bounds with LRU or LFU eviction
//! - TTL expiry, lazy on read plus a periodic sweeper
//! - Durable L2 with compression, namespace isolation and index recovery
//! - L2 hits promoted into L1 with their original expiry
//! - Invalidation by tag and by global version
//! - Stampede protection, cache warming and refresh-ahead
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tiercache::{CacheConfig, CacheManager};
//!
//! # async fn demo() -> tiercache::Result<()> {
//! let cache: CacheManager<String> = CacheManager::new(CacheConfig::default()).await?;
//!
//! let card = cache
//!     .get_or_compute(
//!         "deck:42:card:7",
//!         || async { Ok("What is ownership?".to_string()) },
//!         Some(Duration::from_secs(3600)),
//!     )
//!     .await?;
//! assert_eq!(card, "What is ownership?");
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, eviction policies, storage backends and the manager
//! - [`config`] - YAML configuration
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheEntry, CacheManager, CacheStatistics, CacheStrategy, CacheValue, EvictionPolicyKind,
    L1Cache, L1Config, L2BackendKind, L2Cache, L2Config, ManagerConfig, ManagerStatistics,
    PurgeReport, WarmReport,
};
pub use config::CacheConfig;
pub use error::{Error, Result};
