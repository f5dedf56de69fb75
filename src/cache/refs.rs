//! Handles to cache records
//!
//! Every handle counts as one reference on its record. Call `release` when
//! done; a handle dropped without it is released in the background.

use super::manager::Inner;
use super::options::{DescHandlers, RefConfig};
use super::record::{new_id, CacheRecord, Parents};
use super::remotes::Remote;
use crate::descriptor::Descriptor;
use crate::compression::Compression;
use crate::error::{CacheError, CacheResult};
use crate::metadata::{RecordKind, RecordMetadata};
use crate::snapshot::{ActiveMount, Mount};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared read-only handle to a committed record
pub struct ImmutableRef {
    pub(crate) rec: Arc<CacheRecord>,
    pub(crate) inner: Arc<Inner>,
    pub(crate) handlers: DescHandlers,
    released: bool,
}

impl ImmutableRef {
    pub(crate) fn new(rec: Arc<CacheRecord>, inner: Arc<Inner>, handlers: DescHandlers) -> Self {
        Self {
            rec,
            inner,
            handlers,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.rec.id
    }

    /// Snapshot of the persisted record
    pub fn info(&self) -> RecordMetadata {
        self.rec.md()
    }

    pub fn kind(&self) -> RecordKind {
        self.rec.kind()
    }

    /// Content exists only as a blob so far
    pub fn is_lazy(&self) -> bool {
        self.rec.blob_only()
    }

    pub fn descriptor_handlers(&self) -> &DescHandlers {
        &self.handlers
    }

    /// Mounts of the record's snapshot, extracting it first if needed
    ///
    /// Immutable mounts are always read-only; `readonly = false` is accepted
    /// and ignored.
    pub async fn mount(&self, _readonly: bool) -> CacheResult<Vec<Mount>> {
        self.extract(&CancellationToken::new()).await?;
        self.inner.record_mounts(&self.rec, true).await
    }

    /// Take a slot in the mount pool for this ref's snapshot
    pub async fn mount_pooled(&self) -> CacheResult<ActiveMount> {
        let mounts = self.mount(true).await?;
        self.inner.mount_pool.mount(&mounts).await
    }

    /// Build the record's snapshot locally if it does not exist yet
    ///
    /// Lazy layers are pulled from the content store or the descriptor
    /// handlers and applied; merge and diff records are synthesized. Calling
    /// it again is a no-op.
    pub async fn extract(&self, cancel: &CancellationToken) -> CacheResult<()> {
        self.inner
            .ensure_materialized(&self.rec, &self.handlers, cancel)
            .await
    }

    /// Attach a layer blob to this ref
    pub async fn set_blob(&self, desc: Descriptor) -> CacheResult<()> {
        self.inner.set_blob(&self.rec, desc).await
    }

    /// Recompute chain ids from ancestry; records in `visited` are skipped
    pub async fn compute_chain_metadata(&self, visited: &mut HashSet<String>) -> CacheResult<()> {
        self.inner.compute_chain(&self.rec, visited).await
    }

    /// Descriptor chains for exporting this ref
    pub async fn get_remotes(
        &self,
        create_if_needed: bool,
        cfg: &RefConfig,
        all_variants: bool,
        cancel: &CancellationToken,
    ) -> CacheResult<Vec<Remote>> {
        self.inner
            .get_remotes(&self.rec, &self.handlers, create_if_needed, cfg, all_variants, cancel)
            .await
    }

    /// The blob for this ref's layer in `compression`, if one was produced
    pub async fn get_blob_with_compression(
        &self,
        compression: Compression,
    ) -> CacheResult<Descriptor> {
        self.inner
            .get_blob_with_compression(&self.rec, compression)
            .await
    }

    /// Record `desc` as another encoding of this ref's blob
    pub async fn link_blob(&self, desc: &Descriptor) -> CacheResult<()> {
        self.inner.link_blob(&self.rec, desc).await
    }

    /// Detach a freshly committed ref from the mutable it came from
    pub async fn finalize(&self) -> CacheResult<()> {
        self.inner.finalize(&self.rec).await
    }

    pub async fn release(mut self) -> CacheResult<()> {
        self.released = true;
        self.inner.release_immutable(&self.rec).await
    }
}

impl Clone for ImmutableRef {
    fn clone(&self) -> Self {
        self.inner.immutable_handle(&self.rec, self.handlers.clone())
    }
}

impl std::fmt::Debug for ImmutableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableRef")
            .field("id", &self.rec.id)
            .field("kind", &self.rec.kind())
            .finish()
    }
}

impl Drop for ImmutableRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let inner = self.inner.clone();
        let rec = self.rec.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.release_immutable(&rec).await {
                        warn!("Releasing ref {}: {}", rec.id, e);
                    }
                });
            }
            Err(_) => {
                rec.release_one();
            }
        }
    }
}

/// Exclusive writable handle to an active record
pub struct MutableRef {
    pub(crate) rec: Arc<CacheRecord>,
    pub(crate) inner: Arc<Inner>,
    released: bool,
}

impl MutableRef {
    pub(crate) fn new(rec: Arc<CacheRecord>, inner: Arc<Inner>) -> Self {
        Self {
            rec,
            inner,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.rec.id
    }

    pub fn info(&self) -> RecordMetadata {
        self.rec.md()
    }

    /// Mounts of the active snapshot
    pub async fn mount(&self, readonly: bool) -> CacheResult<Vec<Mount>> {
        self.inner.record_mounts(&self.rec, readonly).await
    }

    pub async fn mount_pooled(&self, readonly: bool) -> CacheResult<ActiveMount> {
        let mounts = self.mount(readonly).await?;
        self.inner.mount_pool.mount(&mounts).await
    }

    /// Commit the snapshot as a new immutable ref
    ///
    /// The immutable shares this ref's snapshot until it is finalized; until
    /// then `get_mutable` on this id fails with `Locked` while the immutable
    /// is held.
    pub async fn commit(mut self) -> CacheResult<ImmutableRef> {
        let inner = self.inner.clone();
        let mut reg = inner.registry.lock().await;
        if self.rec.is_dead() {
            return Err(CacheError::invalid(self.id(), "ref was removed"));
        }
        if self.rec.equal_immutable().is_some() {
            return Err(CacheError::invalid(self.id(), "ref is already committed"));
        }

        let id = new_id();
        let mutable = self.rec.md();
        let mut md = RecordMetadata::new(&id, RecordKind::Committed, &id);
        md.parent = mutable.parent.clone();
        md.equal_mutable = Some(mutable.id.clone());
        md.description = mutable.description.clone();
        md.record_type = mutable.record_type;
        md.cache_policy = mutable.cache_policy;

        inner.leases.create(&id, BTreeMap::new()).await?;
        inner.persist(&md).await?;
        let updated = self
            .rec
            .update_md(|md| md.equal_immutable = Some(id.clone()));
        inner.persist(&updated).await?;

        let parents = match &self.rec.parents {
            Parents::Layer(p) => Parents::Layer(p.clone()),
            _ => Parents::None,
        };
        let imm = CacheRecord::new(md, parents);
        let handle = inner.immutable_handle(&imm, DescHandlers::new());
        reg.insert(imm);

        self.released = true;
        self.rec.release_one();
        info!("Committed mutable ref {} as {}", mutable.id, id);
        Ok(handle)
    }

    pub async fn release(mut self) -> CacheResult<()> {
        self.released = true;
        self.inner.release_mutable(&self.rec).await
    }
}

impl std::fmt::Debug for MutableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableRef").field("id", &self.rec.id).finish()
    }
}

impl Drop for MutableRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let inner = self.inner.clone();
        let rec = self.rec.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.release_mutable(&rec).await {
                        warn!("Releasing mutable ref {}: {}", rec.id, e);
                    }
                });
            }
            Err(_) => {
                rec.release_one();
            }
        }
    }
}
