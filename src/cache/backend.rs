//! Blob Storage Backends
//!
//! The durable tier stores named blobs through [`StorageBackend`]. Names are
//! flat (no directories) and chosen by the caller.
//!
//! # Design
//!
//! - Async I/O for non-blocking storage access
//! - Pluggable backend (local directory, in-memory)
//! - Writes are atomic on disk: temp file in the same directory, then rename

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::error::Result;

/// Suffix for in-progress writes; never listed
const TEMP_SUFFIX: &str = ".tmp";

/// Blob storage backend trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a blob, `None` when it does not exist
    async fn read(&self, name: &str) -> Result<Option<Bytes>>;

    /// Create or replace a blob
    async fn write(&self, name: &str, data: Bytes) -> Result<()>;

    /// Remove a blob; true if it existed
    async fn remove(&self, name: &str) -> Result<bool>;

    /// Names of all stored blobs
    async fn list(&self) -> Result<Vec<String>>;

    /// Get storage statistics
    fn stats(&self) -> BackendStats;

    /// Human-readable location
    fn describe(&self) -> String;
}

/// Backend operation counters
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Remove operations
    pub removes: u64,
    /// Bytes written
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    bytes_written: AtomicU64,
}

impl OpCounters {
    fn snapshot(&self) -> BackendStats {
        BackendStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Disk Backend
// =============================================================================

/// Directory of files, one blob per file
#[derive(Debug)]
pub struct DiskBackend {
    root: PathBuf,
    counters: OpCounters,
}

impl DiskBackend {
    /// Open (and create if needed) a storage directory
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        debug!(path = %root.display(), "Opened disk backend");
        Ok(Self {
            root,
            counters: OpCounters::default(),
        })
    }

    /// Storage directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl StorageBackend for DiskBackend {
    async fn read(&self, name: &str) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::read(self.path(name)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let temp = self
            .root
            .join(format!(".{}.{}{}", name, uuid::Uuid::new_v4(), TEMP_SUFFIX));
        if let Err(e) = tokio::fs::write(&temp, &data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp, self.path(name)).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = item.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot()
    }

    fn describe(&self) -> String {
        format!("disk:{}", self.root.display())
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// In-memory backend for tests and ephemeral caches
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    blobs: DashMap<String, Bytes>,
    counters: OpCounters,
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn read(&self, name: &str) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.blobs.get(name).map(|data| data.clone()))
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.blobs.insert(name.to_string(), data);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        Ok(self.blobs.remove(name).is_some())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.blobs.iter().map(|item| item.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}


// =============================================================================
// Tests
// =============================================================================
