//! Configuration management for snapcache

pub mod schema;

pub use schema::{CompressionConfig, Config, GcConfig, GeneralConfig, StoreConfig};

use crate::error::{CacheError, CacheResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("snapcache")
            .join("config.toml")
    }

    /// Default store root
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("snapcache")
    }

    pub fn snapshots_dir(root: &Path) -> PathBuf {
        root.join("snapshots")
    }

    pub fn content_dir(root: &Path) -> PathBuf {
        root.join("content")
    }

    pub fn metadata_dir(root: &Path) -> PathBuf {
        root.join("metadata")
    }

    pub fn leases_path(root: &Path) -> PathBuf {
        root.join("leases.json")
    }

    /// Scratch directory for pooled mounts; emptied on open
    pub fn mount_pool_dir(root: &Path) -> PathBuf {
        root.join("mounts")
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub async fn load(&self) -> CacheResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> CacheResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| CacheError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> CacheResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            CacheError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    async fn ensure_config_dir(&self) -> CacheResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::DirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure every directory under a store root exists
    pub async fn ensure_state_dirs(root: &Path) -> CacheResult<()> {
        let dirs = [
            root.to_path_buf(),
            Self::snapshots_dir(root),
            Self::content_dir(root),
            Self::metadata_dir(root),
            Self::mount_pool_dir(root),
        ];

        for dir in &dirs {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| CacheError::DirCreate {
                    path: dir.clone(),
                    source: e,
                })?;
        }

        // Snapshot contents may be private build state
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(root, perms)
                .map_err(|e| CacheError::io("setting store root permissions", e))?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
