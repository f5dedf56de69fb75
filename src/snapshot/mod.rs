//! Snapshotter abstraction and mount handling

pub mod native;
pub mod pool;

pub use native::NativeSnapshotter;
pub use pool::{ActiveMount, MountPool};

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// State of a snapshot in the snapshotter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Active,
    View,
    Committed,
}

/// Snapshot bookkeeping as reported by `stat` and `walk`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub parent: Option<String>,
    pub kind: Kind,
    pub created_at: DateTime<Utc>,
}

/// Disk consumed by a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub size: u64,
    pub inodes: u64,
}

/// A single mount description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: PathBuf,
    pub options: Vec<String>,
}

impl Mount {
    /// Recursive bind mount of a directory
    pub fn bind(source: impl Into<PathBuf>, readonly: bool) -> Self {
        Self {
            kind: "bind".to_string(),
            source: source.into(),
            options: vec![
                "rbind".to_string(),
                if readonly { "ro" } else { "rw" }.to_string(),
            ],
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    /// Same mount with `rw` replaced by `ro`
    pub fn into_readonly(mut self) -> Self {
        self.options.retain(|o| o != "rw" && o != "ro");
        self.options.push("ro".to_string());
        self
    }
}

/// Force every mount in a set read-only
pub fn readonly_mounts(mounts: Vec<Mount>) -> Vec<Mount> {
    mounts.into_iter().map(Mount::into_readonly).collect()
}

/// Directory backing a single bind mount
pub fn mount_path(mounts: &[Mount]) -> CacheResult<&Path> {
    match mounts {
        [m] if m.kind == "bind" => Ok(&m.source),
        [m] => Err(CacheError::UnsupportedMount(format!(
            "mount type {} has no local path",
            m.kind
        ))),
        _ => Err(CacheError::UnsupportedMount(format!(
            "expected one mount, got {}",
            mounts.len()
        ))),
    }
}

/// One `(lower, upper)` difference fed to a merge; `None` is the empty tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub lower: Option<String>,
    pub upper: Option<String>,
}

/// Storage engine for filesystem snapshots
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Create a writable snapshot, copying `parent` if given
    async fn prepare(&self, key: &str, parent: Option<&str>) -> CacheResult<Vec<Mount>>;

    /// Create a read-only snapshot of `parent`
    async fn view(&self, key: &str, parent: Option<&str>) -> CacheResult<Vec<Mount>>;

    async fn mounts(&self, key: &str) -> CacheResult<Vec<Mount>>;

    /// Turn active snapshot `key` into committed snapshot `name`
    async fn commit(&self, name: &str, key: &str) -> CacheResult<()>;

    async fn usage(&self, key: &str) -> CacheResult<Usage>;

    async fn stat(&self, key: &str) -> CacheResult<SnapshotInfo>;

    /// Remove a snapshot; fails while other snapshots name it as parent
    async fn remove(&self, key: &str) -> CacheResult<()>;

    async fn walk(&self) -> CacheResult<Vec<SnapshotInfo>>;
}

/// Snapshotters that can union or subtract snapshots natively
#[async_trait]
pub trait MergeSnapshotter: Snapshotter {
    /// Commit `key` as the ordered application of every difference in `diffs`
    async fn merge(&self, key: &str, diffs: &[Diff]) -> CacheResult<()>;

    /// Commit `key` as the difference from `lower` to `upper`
    async fn diff(&self, key: &str, lower: Option<&str>, upper: Option<&str>) -> CacheResult<()> {
        let diff = Diff {
            lower: lower.map(str::to_string),
            upper: upper.map(str::to_string),
        };
        self.merge(key, std::slice::from_ref(&diff)).await
    }
}

/// Whether a snapshot exists
pub async fn exists<S: Snapshotter + ?Sized>(snapshotter: &S, key: &str) -> CacheResult<bool> {
    match snapshotter.stat(key).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
