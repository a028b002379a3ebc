//! Cache configuration
//!
//! The whole tree deserializes with defaults, so a YAML file only needs the
//! values it changes:
//!
//! ```yaml
//! l1:
//!   max_size: 5000
//!   eviction_policy: LFU
//!   default_ttl: 300        # seconds
//! l2:
//!   disk_path: /var/cache/flashcards
//!   namespace: decks
//!   default_ttl: 1h         # unit strings are accepted too
//! manager:
//!   strategy: refresh_ahead
//!   sweep_interval: 30s
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{L1Config, L2Config, ManagerConfig};
use crate::error::{Error, Result};

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1: L1Config,
    pub l2: L2Config,
    pub manager: ManagerConfig,
}

impl CacheConfig {
    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no cache could honour
    pub fn validate(&self) -> Result<()> {
        if self.l1.max_memory_mb.is_nan() || self.l1.max_memory_mb < 0.0 {
            return Err(Error::Config("l1.max_memory_mb must not be negative".into()));
        }
        if self.manager.enable_l2 {
            self.l2.validate()?;
        }
        if self.manager.sweep_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::Config("manager.sweep_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Parse a duration such as `"90"`, `"0.5"`, `"250ms"`, `"5m"` or `"1h30m"`.
///
/// A bare number is seconds and may be fractional.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }
    if let Ok(secs) = s.parse::<f64>() {
        return duration_from_secs(secs);
    }

    let mut total = 0.0_f64;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let secs = match unit {
            "ms" => value / 1000.0,
            "s" | "S" | "" => value,
            "m" | "M" => value * 60.0,
            "h" | "H" => value * 3600.0,
            "d" | "D" => value * 86400.0,
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };

        total += secs;
        rest = next;
    }

    duration_from_secs(total)
}

/// Non-negative, finite seconds to a `Duration`
pub fn duration_from_secs(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::DurationParse(format!("{} is not a valid duration: {}", secs, e)))
}

/// Serde adapter for `Option<Duration>` fields.
///
/// Serializes as float seconds; deserializes from a number of seconds or a
/// [`parse_duration`] string. `null` or an absent field means no duration.
pub mod opt_duration {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<Raw> = Option::deserialize(deserializer)?;
        raw.map(|raw| match raw {
            Raw::Secs(secs) => super::duration_from_secs(secs),
            Raw::Text(text) => super::parse_duration(&text),
        })
        .transpose()
        .map_err(D::Error::custom)
    }
}
