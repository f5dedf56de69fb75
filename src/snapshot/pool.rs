//! Bounded pool of live mount points
//!
//! Each live mount is tracked by a marker file in the pool directory so a
//! crashed process leaves evidence that the next startup clears. Mounting the
//! same source twice shares one pool entry.

use super::{mount_path, Mount};
use crate::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

struct PoolEntry {
    marker: PathBuf,
    refs: usize,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<PathBuf, PoolEntry>,
}

/// Limits how many distinct sources are mounted at once
#[derive(Clone)]
pub struct MountPool {
    dir: PathBuf,
    permits: Arc<Semaphore>,
    state: Arc<Mutex<PoolState>>,
    next: Arc<AtomicU64>,
}

impl MountPool {
    /// Open the pool, discarding entries left behind by a previous process
    pub async fn open(dir: impl Into<PathBuf>, size: usize) -> CacheResult<Self> {
        let dir = dir.into();
        let removed = clear_dir(&dir).await?;
        if removed > 0 {
            warn!("Cleared {} stale mount pool entries in {}", removed, dir.display());
        }
        Ok(Self {
            dir,
            permits: Arc::new(Semaphore::new(size.max(1))),
            state: Arc::new(Mutex::new(PoolState::default())),
            next: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of distinct sources currently mounted
    pub fn active(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Make `mounts` available locally, waiting for a free slot if needed
    pub async fn mount(&self, mounts: &[Mount]) -> CacheResult<ActiveMount> {
        let source = mount_path(mounts)?.to_path_buf();
        let readonly = mounts.iter().all(Mount::is_readonly);

        if self.share(&source) {
            return Ok(self.active_mount(source, readonly));
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| CacheError::Internal("mount pool closed".to_string()))?;
        let marker = self
            .dir
            .join(format!("mnt-{}", self.next.fetch_add(1, Ordering::Relaxed)));
        fs::write(&marker, source.to_string_lossy().as_bytes())
            .await
            .map_err(|e| CacheError::io(format!("writing pool marker {}", marker.display()), e))?;

        let mut state = self.state.lock();
        match state.entries.get_mut(&source) {
            // Lost a race with another mount of the same source
            Some(entry) => {
                entry.refs += 1;
                if let Err(e) = std::fs::remove_file(&marker) {
                    debug!("Removing pool marker {}: {}", marker.display(), e);
                }
            }
            None => {
                debug!("Mounted {} via {}", source.display(), marker.display());
                state.entries.insert(
                    source.clone(),
                    PoolEntry {
                        marker,
                        refs: 1,
                        _permit: permit,
                    },
                );
            }
        }
        drop(state);
        Ok(self.active_mount(source, readonly))
    }

    fn share(&self, source: &Path) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(source) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    fn active_mount(&self, path: PathBuf, readonly: bool) -> ActiveMount {
        ActiveMount {
            path,
            readonly,
            state: Arc::clone(&self.state),
        }
    }

    /// Drop every entry and empty the pool directory
    pub async fn close(&self) -> CacheResult<()> {
        self.state.lock().entries.clear();
        clear_dir(&self.dir).await.map(|_| ())
    }
}

/// A mounted source; unmounted when dropped
pub struct ActiveMount {
    path: PathBuf,
    readonly: bool,
    state: Arc<Mutex<PoolState>>,
}

impl ActiveMount {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let done = match state.entries.get_mut(&self.path) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => false,
        };
        if done {
            if let Some(entry) = state.entries.remove(&self.path) {
                if let Err(e) = std::fs::remove_file(&entry.marker) {
                    debug!("Removing pool marker {}: {}", entry.marker.display(), e);
                }
            }
        }
    }
}

async fn clear_dir(dir: &Path) -> CacheResult<usize> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| CacheError::DirCreate { path: dir.to_path_buf(), source: e })?;
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| CacheError::io(format!("reading {}", dir.display()), e))?;
    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CacheError::io("reading pool entry", e))?
    {
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        result.map_err(|e| CacheError::io(format!("removing {}", path.display()), e))?;
        removed += 1;
    }
    Ok(removed)
}
