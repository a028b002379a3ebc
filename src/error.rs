//! Error types for the tiered cache engine

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can cross the cache API boundary.
///
/// Misses (absent, expired or corrupted entries) are never errors; only
/// backend failures, codec failures on the write path, configuration problems
/// and compute-function failures are surfaced.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from a storage backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// A caller-supplied compute function failed.
    ///
    /// The source is shared so that every caller waiting on the same
    /// computation receives the same error.
    #[error("Compute failed for key {key}: {reason}")]
    Compute {
        key: String,
        reason: Arc<anyhow::Error>,
    },

    /// A computed value could not be written to the durable tier.
    ///
    /// Shared like [`Error::Compute`]; every waiter sees the same failure.
    #[error("Failed to store computed value for key {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: Arc<Error>,
    },
}

impl Error {
    /// Whether the error came from a caller-supplied compute function
    pub fn is_compute(&self) -> bool {
        matches!(self, Error::Compute { .. })
    }
}
