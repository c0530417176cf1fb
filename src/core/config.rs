//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML files. Sections mirror the engine's
//! components: KV size limits, compaction policy, lease housekeeping, watch
//! defaults and filesystem paths.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// KV size limits.
    #[serde(default)]
    pub kv: KvLimitsConfig,

    /// Compaction policy.
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Lease housekeeping.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Watch defaults.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Filesystem paths.
    #[serde(default)]
    pub paths: PathConfig,
}

/// Size limits applied to client puts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvLimitsConfig {
    /// Reject puts whose key exceeds this many bytes.
    #[serde(default = "default_max_kv_key_size")]
    pub max_kv_key_size: usize,

    /// Reject puts whose value exceeds this many bytes.
    #[serde(default = "default_max_kv_value_size")]
    pub max_kv_value_size: usize,
}

/// Auto-compaction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Enable the periodic compactor.
    #[serde(default)]
    pub auto_compaction: bool,

    /// Number of revisions retained behind the newest one.
    #[serde(default = "default_compaction_retention_rev_count")]
    pub compaction_retention_rev_count: i64,

    /// Period between compactor runs in milliseconds.
    #[serde(default = "default_compaction_interval_ms")]
    pub interval_ms: u64,
}

/// Lease housekeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Period between expiry scans in milliseconds.
    #[serde(default = "default_lease_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// Watch defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Client-visible timeout for a parked watch call in milliseconds.
    #[serde(default = "default_watch_timeout_ms")]
    pub default_timeout_ms: u64,
}

/// Filesystem paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Directory holding the meta-writer log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_max_kv_key_size() -> usize {
    4096
}

fn default_max_kv_value_size() -> usize {
    8192
}

fn default_compaction_retention_rev_count() -> i64 {
    1000
}

fn default_compaction_interval_ms() -> u64 {
    300_000
}

fn default_lease_tick_interval_ms() -> u64 {
    1000
}

fn default_watch_timeout_ms() -> u64 {
    60_000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for KvLimitsConfig {
    fn default() -> Self {
        Self {
            max_kv_key_size: default_max_kv_key_size(),
            max_kv_value_size: default_max_kv_value_size(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto_compaction: false,
            compaction_retention_rev_count: default_compaction_retention_rev_count(),
            interval_ms: default_compaction_interval_ms(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_lease_tick_interval_ms(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_watch_timeout_ms(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.kv.max_kv_key_size == 0 {
            anyhow::bail!("kv.max_kv_key_size must be > 0");
        }
        if self.kv.max_kv_value_size == 0 {
            anyhow::bail!("kv.max_kv_value_size must be > 0");
        }
        if self.compaction.compaction_retention_rev_count < 0 {
            anyhow::bail!("compaction.compaction_retention_rev_count must be >= 0");
        }
        if self.compaction.interval_ms == 0 {
            anyhow::bail!("compaction.interval_ms must be > 0");
        }
        if self.lease.tick_interval_ms == 0 {
            anyhow::bail!("lease.tick_interval_ms must be > 0");
        }
        if self.watch.default_timeout_ms == 0 {
            anyhow::bail!("watch.default_timeout_ms must be > 0");
        }
        Ok(())
    }
}
