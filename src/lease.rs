//! Leases protecting snapshots and blobs from garbage collection
//!
//! A lease is a named set of resources. Anything referenced by a lease is a
//! GC root. The cache holds one lease per record, named after the record.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Type of resource a lease can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Snapshot,
    Content,
}

/// A resource kept alive by a lease
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub id: String,
}

impl Resource {
    pub fn snapshot(key: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Snapshot,
            id: key.into(),
        }
    }

    pub fn content(digest: impl fmt::Display) -> Self {
        Self {
            kind: ResourceKind::Content,
            id: digest.to_string(),
        }
    }
}

/// A named lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: BTreeSet<Resource>,
}

#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Create a lease; creating an existing lease returns it unchanged
    async fn create(&self, id: &str, labels: BTreeMap<String, String>) -> CacheResult<Lease>;

    /// Delete a lease; deleting a missing lease is not an error
    async fn delete(&self, id: &str) -> CacheResult<()>;

    async fn add_resource(&self, id: &str, resource: Resource) -> CacheResult<()>;

    async fn delete_resource(&self, id: &str, resource: &Resource) -> CacheResult<()>;

    async fn list(&self) -> CacheResult<Vec<Lease>>;

    async fn resources(&self, id: &str) -> CacheResult<Vec<Resource>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseFile {
    #[serde(default)]
    leases: BTreeMap<String, Lease>,
}

/// Lease manager persisting every lease in one JSON document
pub struct FileLeaseManager {
    path: PathBuf,
    state: Mutex<LeaseFile>,
}

impl FileLeaseManager {
    pub async fn open(path: impl Into<PathBuf>) -> CacheResult<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LeaseFile::default(),
            Err(e) => {
                return Err(CacheError::io(
                    format!("reading leases from {}", path.display()),
                    e,
                ))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn save(&self, state: &LeaseFile) -> CacheResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::DirCreate { path: parent.to_path_buf(), source: e })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?)
            .await
            .map_err(|e| CacheError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CacheError::io(format!("writing leases to {}", self.path.display()), e))
    }
}

fn missing(id: &str) -> CacheError {
    CacheError::NotFound(format!("lease {}", id))
}

#[async_trait]
impl LeaseManager for FileLeaseManager {
    async fn create(&self, id: &str, labels: BTreeMap<String, String>) -> CacheResult<Lease> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.leases.get(id) {
            return Ok(existing.clone());
        }
        let lease = Lease {
            id: id.to_string(),
            created_at: Utc::now(),
            labels,
            resources: BTreeSet::new(),
        };
        state.leases.insert(id.to_string(), lease.clone());
        self.save(&state).await?;
        debug!("Created lease {}", id);
        Ok(lease)
    }

    async fn delete(&self, id: &str) -> CacheResult<()> {
        let mut state = self.state.lock().await;
        if state.leases.remove(id).is_some() {
            self.save(&state).await?;
            debug!("Deleted lease {}", id);
        }
        Ok(())
    }

    async fn add_resource(&self, id: &str, resource: Resource) -> CacheResult<()> {
        let mut state = self.state.lock().await;
        let lease = state.leases.get_mut(id).ok_or_else(|| missing(id))?;
        if lease.resources.insert(resource) {
            self.save(&state).await?;
        }
        Ok(())
    }

    async fn delete_resource(&self, id: &str, resource: &Resource) -> CacheResult<()> {
        let mut state = self.state.lock().await;
        let lease = state.leases.get_mut(id).ok_or_else(|| missing(id))?;
        if lease.resources.remove(resource) {
            self.save(&state).await?;
        }
        Ok(())
    }

    async fn list(&self) -> CacheResult<Vec<Lease>> {
        Ok(self.state.lock().await.leases.values().cloned().collect())
    }

    async fn resources(&self, id: &str) -> CacheResult<Vec<Resource>> {
        let state = self.state.lock().await;
        let lease = state.leases.get(id).ok_or_else(|| missing(id))?;
        Ok(lease.resources.iter().cloned().collect())
    }
}
