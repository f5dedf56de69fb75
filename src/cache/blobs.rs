//! Layer blobs, chain ids and the compression variant index
//!
//! Variants are recorded as content labels on both blobs, so the index is a
//! graph with cycles. Every walk over it carries a visited set.

use super::manager::Inner;
use super::record::{CacheRecord, Parents};
use crate::compression::Compression;
use crate::content::{blob_labels, variant_label};
use crate::descriptor::Descriptor;
use crate::digest::{self, Digest};
use crate::error::{CacheError, CacheResult};
use crate::lease::Resource;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Async mutex per string key; idle keys are dropped
#[derive(Default)]
pub(crate) struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedMutex {
    pub(crate) async fn lock(&self, key: impl Into<String>) -> KeyedGuard<'_> {
        let key = key.into();
        let mutex = self.locks.lock().entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }
}

pub(crate) struct KeyedGuard<'a> {
    owner: &'a KeyedMutex,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.owner.locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Diff id and blob digest of a record's own layer
fn layer_ids(rec: &CacheRecord) -> CacheResult<(Digest, Digest)> {
    let md = rec.md();
    let blob = md
        .blob
        .ok_or_else(|| CacheError::invalid(&rec.id, "ref has no blob"))?;
    let diff_id = match md.diff_id {
        Some(d) => d,
        None => blob.diff_id()?,
    };
    Ok((diff_id, blob.digest))
}

impl Inner {
    /// Attach `desc` as the record's layer blob
    ///
    /// Setting the same content again is a no-op; a blob with the same diff
    /// id but another digest is linked as a variant. A different diff id is
    /// rejected.
    pub(crate) async fn set_blob(
        &self,
        rec: &Arc<CacheRecord>,
        desc: Descriptor,
    ) -> CacheResult<()> {
        self.finalize(rec).await?;
        let diff_id = desc.diff_id()?;
        let info = self.content.info(&desc.digest).await?;
        match info.uncompressed() {
            Some(actual) if actual != diff_id => {
                return Err(CacheError::ContentMismatch {
                    expected: diff_id.to_string(),
                    actual: actual.to_string(),
                });
            }
            Some(_) => {}
            None => {
                self.content
                    .update_labels(&desc.digest, blob_labels(&desc.media_type, &diff_id))
                    .await?;
            }
        }

        let link = {
            let _gc = self.gc_lock.read().await;
            let _op = rec.op.lock().await;
            let md = rec.md();
            match md.blob {
                Some(existing) => {
                    let existing_diff = match md.diff_id {
                        Some(d) => d,
                        None => existing.diff_id()?,
                    };
                    if existing_diff != diff_id {
                        return Err(CacheError::ContentMismatch {
                            expected: existing_diff.to_string(),
                            actual: diff_id.to_string(),
                        });
                    }
                    existing.digest != desc.digest
                }
                None => {
                    self.leases
                        .add_resource(&rec.id, Resource::content(&desc.digest))
                        .await?;
                    let md = rec.update_md(|md| {
                        md.blob = Some(desc.clone());
                        md.diff_id = Some(diff_id.clone());
                    });
                    self.persist(&md).await?;
                    debug!("Set blob {} on ref {}", desc.digest, rec.id);
                    false
                }
            }
        };

        if link {
            return self.link_blob(rec, &desc).await;
        }
        self.compute_chain(rec, &mut HashSet::new()).await
    }

    /// Compute `chain_id` and `blob_chain_id`, ancestors first
    pub(crate) fn compute_chain<'a>(
        &'a self,
        rec: &'a Arc<CacheRecord>,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            if !visited.insert(rec.id.clone()) {
                return Ok(());
            }
            if let Parents::Layer(p) = &rec.parents {
                self.compute_chain(p, visited).await?;
            }

            let _op = rec.op.lock().await;
            let (chain, blob_chain) = match &rec.parents {
                Parents::Merge(_) => {
                    let mut chain: Option<Digest> = None;
                    let mut blob_chain: Option<Digest> = None;
                    for layer in rec.layer_chain() {
                        let (diff_id, blob) = layer_ids(&layer)?;
                        chain = Some(digest::chain_id(chain.as_ref(), &diff_id));
                        blob_chain =
                            Some(digest::blob_chain_id(blob_chain.as_ref(), &blob, &diff_id));
                    }
                    match (chain, blob_chain) {
                        (Some(c), Some(b)) => (c, b),
                        _ => return Err(CacheError::invalid(&rec.id, "merge has no layers")),
                    }
                }
                Parents::Layer(p) => {
                    let (diff_id, blob) = layer_ids(rec)?;
                    let (parent_chain, parent_blob_chain) = match (p.chain_id(), p.blob_chain_id()) {
                        (Some(c), Some(b)) => (c, b),
                        _ => return Err(CacheError::invalid(&p.id, "parent has no chain id")),
                    };
                    (
                        digest::chain_id(Some(&parent_chain), &diff_id),
                        digest::blob_chain_id(Some(&parent_blob_chain), &blob, &diff_id),
                    )
                }
                Parents::None | Parents::Diff { .. } => {
                    let (diff_id, blob) = layer_ids(rec)?;
                    (
                        digest::chain_id(None, &diff_id),
                        digest::blob_chain_id(None, &blob, &diff_id),
                    )
                }
            };

            let unchanged = rec.with_md(|md| {
                md.chain_id.as_ref() == Some(&chain) && md.blob_chain_id.as_ref() == Some(&blob_chain)
            });
            if unchanged {
                return Ok(());
            }
            let md = rec.update_md(|md| {
                md.chain_id = Some(chain);
                md.blob_chain_id = Some(blob_chain);
            });
            self.persist(&md).await
        })
    }

    /// Record `desc` as another encoding of the record's blob
    pub(crate) async fn link_blob(
        &self,
        rec: &Arc<CacheRecord>,
        desc: &Descriptor,
    ) -> CacheResult<()> {
        let _gc = self.gc_lock.read().await;
        self.link_blob_locked(rec, desc).await
    }

    /// `link_blob` for callers already holding the gc lock
    pub(crate) async fn link_blob_locked(
        &self,
        rec: &Arc<CacheRecord>,
        desc: &Descriptor,
    ) -> CacheResult<()> {
        let (diff_id, base) = layer_ids(rec)?;
        let linked_diff = desc.diff_id()?;
        if linked_diff != diff_id {
            return Err(CacheError::ContentMismatch {
                expected: diff_id.to_string(),
                actual: linked_diff.to_string(),
            });
        }
        if base == desc.digest {
            return Ok(());
        }

        self.content
            .update_labels(
                &base,
                BTreeMap::from([(variant_label(&desc.digest), desc.digest.to_string())]),
            )
            .await?;
        let mut labels = blob_labels(&desc.media_type, &diff_id);
        labels.insert(variant_label(&base), base.to_string());
        self.content.update_labels(&desc.digest, labels).await?;
        debug!("Linked blob {} as a variant of {}", desc.digest, base);
        Ok(())
    }

    /// Find an encoding of the record's blob in `compression`
    pub(crate) async fn get_blob_with_compression(
        &self,
        rec: &Arc<CacheRecord>,
        compression: Compression,
    ) -> CacheResult<Descriptor> {
        let base = rec
            .with_md(|md| md.blob.clone())
            .ok_or_else(|| CacheError::NotFound(format!("{} has no blob", rec.id)))?;
        if Compression::from_descriptor(&base).ok() == Some(compression) {
            return Ok(base);
        }

        let mut queue = VecDeque::from([base.digest.clone()]);
        let mut visited = HashSet::new();
        while let Some(digest) = queue.pop_front() {
            if !visited.insert(digest.clone()) {
                continue;
            }
            let info = match self.content.info(&digest).await {
                Ok(info) => info,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if digest != base.digest {
                if let Some(desc) = info.descriptor() {
                    if Compression::from_descriptor(&desc).ok() == Some(compression) {
                        return Ok(desc);
                    }
                }
            }
            queue.extend(info.variants());
        }
        Err(CacheError::NotFound(format!(
            "{} blob for ref {}",
            compression, rec.id
        )))
    }
}
