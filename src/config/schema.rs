//! Configuration schema for snapcache
//!
//! Configuration is stored at `~/.config/snapcache/config.toml`

use crate::cache::{PruneInfo, RefConfig};
use crate::compression::Compression;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Where cache state lives
    pub store: StoreConfig,

    /// Prune defaults
    pub gc: GcConfig,

    /// Layer export settings
    pub compression: CompressionConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Cache storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for snapshots, content, leases and metadata
    pub root: PathBuf,

    /// Maximum number of concurrently active pooled mounts
    pub mount_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: super::ConfigManager::state_dir(),
            mount_pool_size: 64,
        }
    }
}

/// Prune defaults used by `snapcache prune`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Keep records used within this many seconds (0 = no age limit)
    pub keep_duration_secs: u64,

    /// Keep unused records up to this many bytes (0 = no budget)
    pub keep_bytes: u64,

    /// Include internal records
    pub all: bool,
}

impl GcConfig {
    /// Prune options seeded from these defaults
    pub fn prune_info(&self) -> PruneInfo {
        PruneInfo {
            all: self.all,
            keep_duration: (self.keep_duration_secs > 0)
                .then(|| Duration::from_secs(self.keep_duration_secs)),
            keep_bytes: self.keep_bytes,
            ..PruneInfo::default()
        }
    }
}

/// Layer compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Compression for newly computed blobs
    pub default: Compression,

    /// Encoder level (None = codec default)
    pub level: Option<i32>,

    /// Convert existing blobs that use another compression
    pub force: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default: Compression::Gzip,
            level: None,
            force: false,
        }
    }
}

impl CompressionConfig {
    pub fn ref_config(&self) -> RefConfig {
        RefConfig {
            compression: self.default,
            level: self.level,
            force: self.force,
            prefer_non_distributable: false,
        }
    }
}
