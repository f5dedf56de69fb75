//! One JSON file per record

use super::{MetadataStore, RecordMetadata};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// Metadata store keeping `<id>.json` files in a directory
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    pub async fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::DirCreate { path: dir.clone(), source: e })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn get(&self, id: &str) -> CacheResult<Option<RecordMetadata>> {
        let path = self.record_path(id);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(
                format!("reading record file {}", path.display()),
                e,
            )),
        }
    }

    async fn put(&self, md: &RecordMetadata) -> CacheResult<()> {
        let path = self.record_path(&md.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", md.id));
        let content = serde_json::to_string_pretty(md)?;
        fs::write(&tmp, content)
            .await
            .map_err(|e| CacheError::io(format!("writing record file {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CacheError::io(format!("writing record file {}", path.display()), e))
    }

    async fn delete(&self, id: &str) -> CacheResult<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(
                format!("deleting record file {}", path.display()),
                e,
            )),
        }
    }

    async fn list(&self) -> CacheResult<Vec<RecordMetadata>> {
        let mut records = vec![];
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| CacheError::io("reading metadata directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io("reading metadata entry", e))?
        {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| CacheError::io(format!("reading {}", path.display()), e))?;
            match serde_json::from_str::<RecordMetadata>(&content) {
                Ok(md) => records.push(md),
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }
}
