//! Directory-backed content store
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/sha256/<hex>          raw blob bytes
//! labels/sha256/<hex>.json    label sidecar
//! ingest/                     temp files awaiting rename
//! ```

use super::{ContentStore, Info, Provider, ReaderAt};
use crate::descriptor::Descriptor;
use crate::digest::{Digest, SHA256};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    created_at: DateTime<Utc>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// Content store rooted at a local directory
pub struct LocalContentStore {
    root: PathBuf,
    label_lock: Mutex<()>,
}

impl LocalContentStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        for dir in [
            root.join("blobs").join(SHA256),
            root.join("labels").join(SHA256),
            root.join("ingest"),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| CacheError::DirCreate { path: dir.clone(), source: e })?;
        }
        Ok(Self {
            root,
            label_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(SHA256).join(digest.encoded())
    }

    fn sidecar_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("labels")
            .join(SHA256)
            .join(format!("{}.json", digest.encoded()))
    }

    async fn read_sidecar(&self, digest: &Digest) -> CacheResult<Sidecar> {
        let path = self.sidecar_path(digest);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sidecar {
                created_at: Utc::now(),
                labels: BTreeMap::new(),
            }),
            Err(e) => Err(CacheError::io(
                format!("reading labels {}", path.display()),
                e,
            )),
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> CacheResult<()> {
        let tmp = self.root.join("ingest").join(Uuid::new_v4().simple().to_string());
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| CacheError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| CacheError::io(format!("renaming into {}", path.display()), e))
    }

    async fn write_sidecar(&self, digest: &Digest, sidecar: &Sidecar) -> CacheResult<()> {
        let content = serde_json::to_vec_pretty(sidecar)?;
        self.write_atomic(&self.sidecar_path(digest), &content).await
    }

    async fn blob_size(&self, digest: &Digest) -> CacheResult<u64> {
        let path = self.blob_path(digest);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::ContentNotFound(digest.to_string()))
            }
            Err(e) => Err(CacheError::io(format!("stat {}", path.display()), e)),
        }
    }

    /// Merge label changes while holding the label lock
    async fn merge_labels(
        &self,
        digest: &Digest,
        changes: BTreeMap<String, String>,
    ) -> CacheResult<Info> {
        let size = self.blob_size(digest).await?;
        let _guard = self.label_lock.lock().await;
        let mut sidecar = self.read_sidecar(digest).await?;
        for (k, v) in changes {
            if v.is_empty() {
                sidecar.labels.remove(&k);
            } else {
                sidecar.labels.insert(k, v);
            }
        }
        self.write_sidecar(digest, &sidecar).await?;
        Ok(Info {
            digest: digest.clone(),
            size,
            labels: sidecar.labels,
            created_at: sidecar.created_at,
        })
    }
}

#[async_trait]
impl Provider for LocalContentStore {
    async fn reader_at(&self, desc: &Descriptor) -> CacheResult<ReaderAt> {
        let path = self.blob_path(&desc.digest);
        match fs::read(&path).await {
            Ok(bytes) => Ok(ReaderAt::new(Arc::new(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::ContentNotFound(desc.digest.to_string()))
            }
            Err(e) => Err(CacheError::io(format!("reading blob {}", path.display()), e)),
        }
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn info(&self, digest: &Digest) -> CacheResult<Info> {
        let size = self.blob_size(digest).await?;
        let sidecar = self.read_sidecar(digest).await?;
        Ok(Info {
            digest: digest.clone(),
            size,
            labels: sidecar.labels,
            created_at: sidecar.created_at,
        })
    }

    async fn write(
        &self,
        reference: &str,
        bytes: Vec<u8>,
        expected: Option<&Digest>,
        labels: BTreeMap<String, String>,
    ) -> CacheResult<Info> {
        let actual = Digest::from_bytes(&bytes);
        if let Some(expected) = expected {
            if *expected != actual {
                return Err(CacheError::DigestInvalid(format!(
                    "{}: expected {}, got {}",
                    reference, expected, actual
                )));
            }
        }

        let path = self.blob_path(&actual);
        if !path.exists() {
            self.write_atomic(&path, &bytes).await?;
            debug!("Stored blob {} ({} bytes) for {}", actual, bytes.len(), reference);
        }
        self.merge_labels(&actual, labels).await
    }

    async fn update_labels(
        &self,
        digest: &Digest,
        labels: BTreeMap<String, String>,
    ) -> CacheResult<Info> {
        self.merge_labels(digest, labels).await
    }

    async fn delete(&self, digest: &Digest) -> CacheResult<()> {
        let path = self.blob_path(digest);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::ContentNotFound(digest.to_string()));
            }
            Err(e) => {
                return Err(CacheError::io(format!("deleting blob {}", path.display()), e));
            }
        }
        let _guard = self.label_lock.lock().await;
        let sidecar = self.sidecar_path(digest);
        if sidecar.exists() {
            fs::remove_file(&sidecar)
                .await
                .map_err(|e| CacheError::io(format!("deleting {}", sidecar.display()), e))?;
        }
        Ok(())
    }

    async fn walk(&self) -> CacheResult<Vec<Info>> {
        let dir = self.root.join("blobs").join(SHA256);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| CacheError::io("reading blob directory", e))?;

        let mut infos = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io("reading blob entry", e))?
        {
            let name = entry.file_name();
            let Ok(digest) = Digest::parse(&format!("{}:{}", SHA256, name.to_string_lossy()))
            else {
                continue;
            };
            match self.info(&digest).await {
                Ok(info) => infos.push(info),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        infos.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(infos)
    }
}
