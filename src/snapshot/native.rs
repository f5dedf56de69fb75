//! Directory-per-snapshot storage
//!
//! Every snapshot is a plain directory under `snapshots/<n>/fs`. Preparing a
//! child copies its parent's tree, so snapshots never share files and any
//! snapshot can be removed once nothing names it as parent. Bookkeeping lives
//! in `metadata.json` next to the snapshot directories.

use super::{Diff, Kind, MergeSnapshotter, Mount, SnapshotInfo, Snapshotter, Usage};
use crate::archive::{apply_layer, copy_tree, diff_dirs, dir_usage};
use crate::compression::Compression;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    id: u64,
    parent: Option<String>,
    kind: Kind,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    next_id: u64,
    snapshots: BTreeMap<String, Entry>,
}

/// Snapshotter storing full directory copies
pub struct NativeSnapshotter {
    root: PathBuf,
    state: Mutex<State>,
}

impl NativeSnapshotter {
    /// Open (creating if needed) a snapshotter rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        let snapshots = root.join("snapshots");
        fs::create_dir_all(&snapshots)
            .await
            .map_err(|e| CacheError::DirCreate { path: snapshots, source: e })?;

        let path = root.join("metadata.json");
        let state = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => {
                return Err(CacheError::io(
                    format!("reading snapshot metadata {}", path.display()),
                    e,
                ))
            }
        };

        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_dir(&self, id: u64) -> PathBuf {
        self.root.join("snapshots").join(id.to_string())
    }

    fn fs_dir(&self, id: u64) -> PathBuf {
        self.snapshot_dir(id).join("fs")
    }

    async fn save(&self, state: &State) -> CacheResult<()> {
        let path = self.root.join("metadata.json");
        let tmp = self.root.join("metadata.json.tmp");
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, content)
            .await
            .map_err(|e| CacheError::io("writing snapshot metadata", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CacheError::io("replacing snapshot metadata", e))
    }

    fn mounts_for(&self, entry: &Entry) -> Vec<Mount> {
        vec![Mount::bind(self.fs_dir(entry.id), entry.kind != Kind::Active)]
    }

    fn info(key: &str, entry: &Entry) -> SnapshotInfo {
        SnapshotInfo {
            key: key.to_string(),
            parent: entry.parent.clone(),
            kind: entry.kind,
            created_at: entry.created_at,
        }
    }

    /// Lookup a committed snapshot's directory
    fn committed_dir(&self, state: &State, key: &str) -> CacheResult<PathBuf> {
        let entry = state
            .snapshots
            .get(key)
            .ok_or_else(|| CacheError::SnapshotNotFound(key.to_string()))?;
        if entry.kind != Kind::Committed {
            return Err(CacheError::invalid(key, "snapshot is not committed"));
        }
        Ok(self.fs_dir(entry.id))
    }

    async fn create(&self, key: &str, parent: Option<&str>, kind: Kind) -> CacheResult<Vec<Mount>> {
        let mut state = self.state.lock().await;
        if state.snapshots.contains_key(key) {
            return Err(CacheError::SnapshotExists(key.to_string()));
        }
        let parent_dir = parent
            .map(|p| self.committed_dir(&state, p))
            .transpose()?;

        let id = state.next_id;
        state.next_id += 1;
        let dir = self.fs_dir(id);
        let populate = {
            tokio::task::spawn_blocking(move || match parent_dir {
                Some(parent_dir) => copy_tree(&parent_dir, &dir),
                None => std::fs::create_dir_all(&dir)
                    .map_err(|e| CacheError::DirCreate { path: dir.clone(), source: e }),
            })
            .await
            .map_err(|e| CacheError::Internal(format!("snapshot copy task failed: {}", e)))?
        };
        if let Err(e) = populate {
            if let Err(cleanup) = fs::remove_dir_all(self.snapshot_dir(id)).await {
                debug!("Removing partial snapshot {}: {}", id, cleanup);
            }
            return Err(e);
        }

        let entry = Entry {
            id,
            parent: parent.map(str::to_string),
            kind,
            created_at: Utc::now(),
        };
        let mounts = self.mounts_for(&entry);
        state.snapshots.insert(key.to_string(), entry);
        self.save(&state).await?;
        debug!("Prepared snapshot {} ({:?}, parent {:?})", key, kind, parent);
        Ok(mounts)
    }
}

#[async_trait]
impl Snapshotter for NativeSnapshotter {
    async fn prepare(&self, key: &str, parent: Option<&str>) -> CacheResult<Vec<Mount>> {
        self.create(key, parent, Kind::Active).await
    }

    async fn view(&self, key: &str, parent: Option<&str>) -> CacheResult<Vec<Mount>> {
        self.create(key, parent, Kind::View).await
    }

    async fn mounts(&self, key: &str) -> CacheResult<Vec<Mount>> {
        let state = self.state.lock().await;
        state
            .snapshots
            .get(key)
            .map(|e| self.mounts_for(e))
            .ok_or_else(|| CacheError::SnapshotNotFound(key.to_string()))
    }

    async fn commit(&self, name: &str, key: &str) -> CacheResult<()> {
        let mut state = self.state.lock().await;
        if state.snapshots.contains_key(name) {
            return Err(CacheError::SnapshotExists(name.to_string()));
        }
        let mut entry = state
            .snapshots
            .remove(key)
            .ok_or_else(|| CacheError::SnapshotNotFound(key.to_string()))?;
        if entry.kind != Kind::Active {
            let kind = entry.kind;
            state.snapshots.insert(key.to_string(), entry);
            return Err(CacheError::invalid(
                key,
                format!("cannot commit {:?} snapshot", kind),
            ));
        }
        entry.kind = Kind::Committed;
        state.snapshots.insert(name.to_string(), entry);
        self.save(&state).await?;
        debug!("Committed snapshot {} as {}", key, name);
        Ok(())
    }

    async fn usage(&self, key: &str) -> CacheResult<Usage> {
        let dir = {
            let state = self.state.lock().await;
            let entry = state
                .snapshots
                .get(key)
                .ok_or_else(|| CacheError::SnapshotNotFound(key.to_string()))?;
            self.fs_dir(entry.id)
        };
        let (size, inodes) = tokio::task::spawn_blocking(move || dir_usage(&dir))
            .await
            .map_err(|e| CacheError::Internal(format!("usage task failed: {}", e)))??;
        Ok(Usage { size, inodes })
    }

    async fn stat(&self, key: &str) -> CacheResult<SnapshotInfo> {
        let state = self.state.lock().await;
        state
            .snapshots
            .get(key)
            .map(|e| Self::info(key, e))
            .ok_or_else(|| CacheError::SnapshotNotFound(key.to_string()))
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        let mut state = self.state.lock().await;
        if !state.snapshots.contains_key(key) {
            return Err(CacheError::SnapshotNotFound(key.to_string()));
        }
        if let Some((child, _)) = state
            .snapshots
            .iter()
            .find(|(_, e)| e.parent.as_deref() == Some(key))
        {
            return Err(CacheError::SnapshotInUse {
                key: key.to_string(),
                reason: format!("snapshot {} depends on it", child),
            });
        }
        let Some(entry) = state.snapshots.remove(key) else {
            return Err(CacheError::SnapshotNotFound(key.to_string()));
        };
        self.save(&state).await?;

        let dir = self.snapshot_dir(entry.id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(format!("removing {}", dir.display()), e)),
        }
        debug!("Removed snapshot {}", key);
        Ok(())
    }

    async fn walk(&self) -> CacheResult<Vec<SnapshotInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .iter()
            .map(|(k, e)| Self::info(k, e))
            .collect())
    }
}

#[async_trait]
impl MergeSnapshotter for NativeSnapshotter {
    async fn merge(&self, key: &str, diffs: &[Diff]) -> CacheResult<()> {
        let mut state = self.state.lock().await;
        if state.snapshots.contains_key(key) {
            return Err(CacheError::SnapshotExists(key.to_string()));
        }
        let mut pairs = Vec::with_capacity(diffs.len());
        for d in diffs {
            let lower = d
                .lower
                .as_deref()
                .map(|l| self.committed_dir(&state, l))
                .transpose()?;
            let upper = d
                .upper
                .as_deref()
                .map(|u| self.committed_dir(&state, u))
                .transpose()?;
            pairs.push((lower, upper));
        }

        let id = state.next_id;
        state.next_id += 1;
        let dir = self.fs_dir(id);
        let result = {
            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&dir)
                    .map_err(|e| CacheError::DirCreate { path: dir.clone(), source: e })?;
                for (lower, upper) in pairs {
                    let layer = diff_dirs(lower.as_deref(), upper.as_deref())?;
                    apply_layer(&dir, &layer, Compression::Uncompressed, &CancellationToken::new())?;
                }
                Ok::<_, CacheError>(())
            })
            .await
            .map_err(|e| CacheError::Internal(format!("merge task failed: {}", e)))?
        };
        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_dir_all(self.snapshot_dir(id)).await {
                debug!("Removing partial snapshot {}: {}", id, cleanup);
            }
            return Err(e);
        }

        state.snapshots.insert(
            key.to_string(),
            Entry {
                id,
                parent: None,
                kind: Kind::Committed,
                created_at: Utc::now(),
            },
        );
        self.save(&state).await?;
        debug!("Merged {} differences into snapshot {}", diffs.len(), key);
        Ok(())
    }
}
