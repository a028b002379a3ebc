//! tiercache - cache maintenance tool
//!
//! Inspects and edits the durable (L2) tier of a cache directory.
//!
//! ```text
//! tiercache --disk-path ./cache/l2 --namespace decks analyze
//! tiercache purge --dry-run
//! tiercache set deck:1 '{"front":"Q","back":"A"}' --ttl 1h --tag deck
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::IndexRecord;
use tiercache::config::parse_duration;
use tiercache::{CacheConfig, CacheManager, L2BackendKind};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Inspect and maintain a tiercache L2 directory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// L2 storage directory (overrides the config file)
    #[arg(long, env = "TIERCACHE_DISK_PATH")]
    disk_path: Option<PathBuf>,

    /// L2 namespace (overrides the config file)
    #[arg(long, env = "TIERCACHE_NAMESPACE")]
    namespace: Option<String>,

    /// Store new payloads uncompressed
    #[arg(long, env = "TIERCACHE_NO_COMPRESSION")]
    no_compression: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize the namespace: entries, bytes, expiry, tags, versions
    Analyze {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove expired entries
    Purge {
        /// Only report what would be removed
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove every entry of the namespace
    Clear,
    /// Print a value as JSON
    Get { key: String },
    /// Store a JSON value
    Set {
        key: String,
        /// Value as JSON text
        value: String,
        /// Time to live ("90", "0.5", "5m", "1h30m")
        #[arg(long, value_parser = parse_ttl)]
        ttl: Option<Duration>,
        /// Tag for bulk invalidation (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Remove a key
    Delete { key: String },
}

fn parse_ttl(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    info!(
        path = %config.l2.disk_path.display(),
        namespace = %config.l2.namespace,
        "Opening cache"
    );
    let cache: CacheManager<Value> = CacheManager::new(config).await?;

    run(&cache, args.command).await?;

    cache.shutdown().await?;
    Ok(())
}

async fn run(cache: &CacheManager<Value>, command: Command) -> anyhow::Result<()> {
    let l2 = cache.l2().context("L2 tier is not enabled")?;

    match command {
        Command::Analyze { json } => {
            let report = AnalyzeReport::build(&l2.records(), l2.namespace(), Utc::now());
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print_table();
            }
        }
        Command::Purge { dry_run } => {
            if dry_run {
                let now = Utc::now();
                let expired = l2
                    .records()
                    .iter()
                    .filter(|record| record.is_expired_at(now))
                    .count();
                println!("{} expired entries would be removed", expired);
            } else {
                let report = cache.purge_expired().await?;
                println!("Removed {} expired entries", report.l2);
            }
        }
        Command::Clear => {
            let count = l2.len();
            cache.clear().await?;
            println!("Removed {} entries from namespace '{}'", count, l2.namespace());
        }
        Command::Get { key } => match cache.get(&key).await? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => bail!("key '{}' not found", key),
        },
        Command::Set {
            key,
            value,
            ttl,
            tags,
        } => {
            let value: Value = serde_json::from_str(&value).context("value must be valid JSON")?;
            cache.set(&key, value, ttl, &tags).await?;
            println!("Stored '{}'", key);
        }
        Command::Delete { key } => {
            if cache.delete(&key).await? {
                println!("Deleted '{}'", key);
            } else {
                println!("Key '{}' not found", key);
            }
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if let Some(path) = &args.disk_path {
        config.l2.disk_path = path.clone();
    }
    if let Some(namespace) = &args.namespace {
        config.l2.namespace = namespace.clone();
    }
    if args.no_compression {
        config.l2.compression = false;
    }
    if config.l2.backend != L2BackendKind::Disk {
        warn!("Configured L2 backend is not on disk; inspecting the disk path instead");
        config.l2.backend = L2BackendKind::Disk;
    }
    config.manager.enable_l2 = true;
    config.manager.sweep_interval = None;

    config.validate()?;
    Ok(config)
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Analyze
// =============================================================================

#[derive(Debug, Serialize)]
struct AnalyzeReport {
    namespace: String,
    entries: usize,
    total_bytes: u64,
    expired: usize,
    without_ttl: usize,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    /// Entries per key version prefix (`v<n>:`)
    versions: BTreeMap<String, usize>,
    tags: BTreeMap<String, usize>,
}

impl AnalyzeReport {
    fn build(records: &[IndexRecord], namespace: &str, now: DateTime<Utc>) -> Self {
        let mut report = AnalyzeReport {
            namespace: namespace.to_string(),
            entries: records.len(),
            total_bytes: records.iter().map(|record| record.size).sum(),
            expired: 0,
            without_ttl: 0,
            oldest: records.iter().map(|record| record.created_at).min(),
            newest: records.iter().map(|record| record.created_at).max(),
            versions: BTreeMap::new(),
            tags: BTreeMap::new(),
        };

        for record in records {
            if record.is_expired_at(now) {
                report.expired += 1;
            }
            if record.expires_at.is_none() {
                report.without_ttl += 1;
            }
            let version = match record.key.split_once(':') {
                Some((prefix, _)) if prefix.starts_with('v') => prefix.to_string(),
                _ => "unversioned".to_string(),
            };
            *report.versions.entry(version).or_default() += 1;
            for tag in &record.tags {
                *report.tags.entry(tag.clone()).or_default() += 1;
            }
        }
        report
    }

    fn print_table(&self) {
        println!("Namespace      {}", self.namespace);
        println!("Entries        {}", self.entries);
        println!("Total size     {}", format_bytes(self.total_bytes));
        println!("Expired        {}", self.expired);
        println!("Without TTL    {}", self.without_ttl);
        if let (Some(oldest), Some(newest)) = (self.oldest, self.newest) {
            println!("Oldest         {}", oldest.to_rfc3339());
            println!("Newest         {}", newest.to_rfc3339());
        }
        if !self.versions.is_empty() {
            println!("\nVersions");
            for (version, count) in &self.versions {
                println!("  {:<20} {}", version, count);
            }
        }
        if !self.tags.is_empty() {
            println!("\nTags");
            for (tag, count) in &self.tags {
                println!("  {:<20} {}", tag, count);
            }
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        let args = Args::try_parse_from([
            "tiercache",
            "--namespace",
            "decks",
            "set",
            "k",
            "{\"a\":1}",
            "--ttl",
            "5m",
            "--tag",
            "x",
            "--tag",
            "y",
        ])
        .unwrap();
        assert_eq!(args.namespace.as_deref(), Some("decks"));
        match args.command {
            Command::Set { key, ttl, tags, .. } => {
                assert_eq!(key, "k");
                assert_eq!(ttl, Some(Duration::from_secs(300)));
                assert_eq!(tags, vec!["x", "y"]);
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Args::try_parse_from(["tiercache", "set", "k", "1", "--ttl", "soon"]).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[tokio::test]
    async fn test_analyze_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::default();
        config.l2.disk_path = dir.path().to_path_buf();
        let cache: CacheManager<Value> = CacheManager::new(config).await.unwrap();

        let deck = vec!["deck".to_string()];
        cache.set("a", Value::from(1), None, &deck).await.unwrap();
        cache
            .set("b", Value::from(2), Some(Duration::from_millis(10)), &deck)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let l2 = cache.l2().unwrap();
        let report = AnalyzeReport::build(&l2.records(), l2.namespace(), Utc::now());
        assert_eq!(report.entries, 2);
        assert_eq!(report.expired, 1);
        assert_eq!(report.without_ttl, 1);
        assert_eq!(report.tags.get("deck"), Some(&2));
        assert_eq!(report.versions.get("v1"), Some(&2));
        assert!(report.total_bytes > 0);
    }
}
