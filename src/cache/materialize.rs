//! Building snapshots for lazy, merge and diff records

use super::manager::Inner;
use super::options::DescHandlers;
use super::record::{new_id, CacheRecord, Parents};
use crate::compression::Compression;
use crate::content::{blob_labels, Provider};
use crate::descriptor::Descriptor;
use crate::error::{CacheError, CacheResult};
use crate::lease::Resource;
use crate::snapshot::{self, Diff, MergeSnapshotter, Snapshotter};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Temporary active snapshot removed unless committed
struct TempSnapshot {
    snapshotter: Arc<dyn MergeSnapshotter>,
    key: Option<String>,
}

impl TempSnapshot {
    fn new(snapshotter: Arc<dyn MergeSnapshotter>, key: String) -> Self {
        Self {
            snapshotter,
            key: Some(key),
        }
    }

    fn disarm(&mut self) {
        self.key = None;
    }

    async fn cleanup(mut self) {
        if let Some(key) = self.key.take() {
            if let Err(e) = self.snapshotter.remove(&key).await {
                warn!("Removing temporary snapshot {}: {}", key, e);
            }
        }
    }
}

impl Drop for TempSnapshot {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let snapshotter = self.snapshotter.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = snapshotter.remove(&key).await {
                    warn!("Removing temporary snapshot {}: {}", key, e);
                }
            });
        }
    }
}

fn merge_component(p: &CacheRecord) -> Diff {
    match &p.parents {
        Parents::Diff { lower, upper } => Diff {
            lower: lower.as_ref().map(|r| r.snapshot_id()),
            upper: upper.as_ref().map(|r| r.snapshot_id()),
        },
        _ => Diff {
            lower: None,
            upper: Some(p.snapshot_id()),
        },
    }
}

impl Inner {
    /// Make sure `rec` has a local snapshot, building ancestors first
    pub(crate) fn ensure_materialized<'a>(
        &'a self,
        rec: &'a Arc<CacheRecord>,
        handlers: &'a DescHandlers,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            match &rec.parents {
                Parents::Merge(ps) => {
                    for p in ps {
                        self.ensure_materialized(p, handlers, cancel).await?;
                    }
                    self.materialize_composite(rec).await
                }
                Parents::Diff { lower, upper } => {
                    for p in lower.iter().chain(upper.iter()) {
                        self.ensure_materialized(p, handlers, cancel).await?;
                    }
                    self.materialize_composite(rec).await
                }
                Parents::Layer(p) => {
                    if !rec.blob_only() {
                        return Ok(());
                    }
                    self.ensure_materialized(p, handlers, cancel).await?;
                    self.extract_record(rec, handlers, cancel).await
                }
                Parents::None => self.extract_record(rec, handlers, cancel).await,
            }
        })
    }

    /// Read a blob from the content store, pulling it through a handler if
    /// the store does not have it
    pub(crate) async fn fetch_blob(
        &self,
        desc: &Descriptor,
        handlers: &DescHandlers,
    ) -> CacheResult<Vec<u8>> {
        match self.content.reader_at(desc).await {
            Ok(reader) => return Ok(reader.as_bytes().to_vec()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let provider = handlers
            .get(&desc.digest)
            .ok_or_else(|| CacheError::LazyContentUnavailable(desc.digest.to_string()))?;
        let bytes = provider.reader_at(desc).await?.as_bytes().to_vec();
        let labels = match desc.uncompressed_digest()? {
            Some(diff_id) => blob_labels(&desc.media_type, &diff_id),
            None => Default::default(),
        };
        self.content
            .write(
                &format!("fetch-{}", desc.digest.encoded()),
                bytes.clone(),
                Some(&desc.digest),
                labels,
            )
            .await?;
        info!("Pulled lazy blob {} ({} bytes)", desc.digest, bytes.len());
        Ok(bytes)
    }

    /// Apply a lazy record's blob on top of its parent's snapshot
    async fn extract_record(
        &self,
        rec: &Arc<CacheRecord>,
        handlers: &DescHandlers,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        if !rec.blob_only() {
            return Ok(());
        }
        let _gc = self.gc_lock.read().await;
        let _op = rec.op.lock().await;
        let md = rec.md();
        if !md.blob_only {
            return Ok(());
        }
        let desc = md
            .blob
            .clone()
            .ok_or_else(|| CacheError::invalid(&rec.id, "lazy ref has no blob"))?;
        let diff_id = match md.diff_id.clone() {
            Some(d) => d,
            None => desc.diff_id()?,
        };

        if !snapshot::exists(&*self.snapshotter, &md.snapshot_id).await? {
            let blob = self.fetch_blob(&desc, handlers).await?;
            let parent_key = match &rec.parents {
                Parents::Layer(p) => Some(p.snapshot_id()),
                _ => None,
            };
            let tmp = format!("extract-{}", new_id());
            let mounts = self.snapshotter.prepare(&tmp, parent_key.as_deref()).await?;
            let mut guard = TempSnapshot::new(self.snapshotter.clone(), tmp.clone());

            let compression = match Compression::from_descriptor(&desc) {
                Ok(c) => c,
                Err(_) => Compression::detect(&blob),
            };
            // Resolves only once the applier stopped writing into the mounts
            match self.applier.apply(&mounts, blob, compression, cancel).await {
                Ok(actual) if actual == diff_id => {}
                Ok(actual) => {
                    guard.cleanup().await;
                    return Err(CacheError::ContentMismatch {
                        expected: diff_id.to_string(),
                        actual: actual.to_string(),
                    });
                }
                Err(e) => {
                    guard.cleanup().await;
                    return Err(e);
                }
            }

            match self.snapshotter.commit(&md.snapshot_id, &tmp).await {
                Ok(()) => guard.disarm(),
                Err(CacheError::SnapshotExists(_)) => {
                    debug!("Snapshot {} appeared during extraction", md.snapshot_id);
                    guard.cleanup().await;
                }
                Err(e) => {
                    guard.cleanup().await;
                    return Err(e);
                }
            }
        }

        self.leases
            .add_resource(&rec.id, Resource::snapshot(&md.snapshot_id))
            .await?;
        let md = rec.update_md(|md| md.blob_only = false);
        self.persist(&md).await?;
        info!("Extracted ref {} from blob {}", rec.id, desc.digest);
        Ok(())
    }

    /// Build the snapshot of a merge or diff record from its parents
    async fn materialize_composite(&self, rec: &Arc<CacheRecord>) -> CacheResult<()> {
        let _gc = self.gc_lock.read().await;
        let _op = rec.op.lock().await;
        let key = rec.snapshot_id();
        if snapshot::exists(&*self.snapshotter, &key).await? {
            return Ok(());
        }
        match &rec.parents {
            Parents::Merge(ps) => {
                let diffs: Vec<Diff> = ps.iter().map(|p| merge_component(p)).collect();
                self.snapshotter.merge(&key, &diffs).await?;
            }
            Parents::Diff { lower, upper } => {
                let lower = lower.as_ref().map(|r| r.snapshot_id());
                let upper = upper.as_ref().map(|r| r.snapshot_id());
                self.snapshotter
                    .diff(&key, lower.as_deref(), upper.as_deref())
                    .await?;
            }
            Parents::None | Parents::Layer(_) => return Ok(()),
        }
        self.leases
            .add_resource(&rec.id, Resource::snapshot(&key))
            .await?;
        debug!("Materialized {:?} ref {}", rec.kind(), rec.id);
        Ok(())
    }
}
