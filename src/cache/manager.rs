//! The cache manager
//!
//! One `Manager` is built at startup and shared by every caller. It owns the
//! record registry and wires the snapshotter, content store, leases and
//! metadata store together.

use super::blobs::KeyedMutex;
use super::options::{DescHandlers, RecordOptions};
use super::record::{new_id, CacheRecord, Parents, Registry};
use super::refs::{ImmutableRef, MutableRef};
use crate::archive::{Applier, ArchiveDiffer, Differ};
use crate::compression::{Converter, StreamConverter};
use crate::config::{ConfigManager, StoreConfig};
use crate::content::{ContentStore, LocalContentStore};
use crate::descriptor::Descriptor;
use crate::digest;
use crate::error::{CacheError, CacheResult};
use crate::gc::{GarbageCollector, LocalCollector};
use crate::lease::{FileLeaseManager, LeaseManager, Resource};
use crate::metadata::{FileMetadataStore, MetadataStore, RecordKind, RecordMetadata};
use crate::snapshot::{self, MergeSnapshotter, Mount, MountPool, NativeSnapshotter, Snapshotter};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collaborators handed to [`Manager::open`]
pub struct ManagerOpt {
    pub snapshotter: Arc<dyn MergeSnapshotter>,
    pub content: Arc<dyn ContentStore>,
    pub leases: Arc<dyn LeaseManager>,
    pub metadata: Arc<dyn MetadataStore>,
    /// Invoked once after prune drops leases
    pub gc: Option<Arc<dyn GarbageCollector>>,
    pub differ: Arc<dyn Differ>,
    pub applier: Arc<dyn Applier>,
    pub converter: Arc<dyn Converter>,
    pub mount_pool: MountPool,
}

/// Entry point for creating, looking up and reclaiming refs
#[derive(Clone)]
pub struct Manager {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) snapshotter: Arc<dyn MergeSnapshotter>,
    pub(crate) content: Arc<dyn ContentStore>,
    pub(crate) leases: Arc<dyn LeaseManager>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) gc: Option<Arc<dyn GarbageCollector>>,
    pub(crate) differ: Arc<dyn Differ>,
    pub(crate) applier: Arc<dyn Applier>,
    pub(crate) converter: Arc<dyn Converter>,
    pub(crate) mount_pool: MountPool,
    pub(crate) registry: Mutex<Registry>,
    /// Held shared while resources are created, exclusively while gc runs
    pub(crate) gc_lock: RwLock<()>,
    pub(crate) conversions: KeyedMutex,
    closed: AtomicBool,
}

impl Manager {
    /// Build a manager over `opt` and recover persisted records
    pub async fn open(opt: ManagerOpt) -> CacheResult<Self> {
        let inner = Arc::new(Inner {
            snapshotter: opt.snapshotter,
            content: opt.content,
            leases: opt.leases,
            metadata: opt.metadata,
            gc: opt.gc,
            differ: opt.differ,
            applier: opt.applier,
            converter: opt.converter,
            mount_pool: opt.mount_pool,
            registry: Mutex::new(Registry::default()),
            gc_lock: RwLock::new(()),
            conversions: KeyedMutex::default(),
            closed: AtomicBool::new(false),
        });
        inner.recover().await?;
        let count = inner.registry.lock().await.records.len();
        info!("Cache manager ready with {} records", count);
        Ok(Self { inner })
    }

    /// Open a manager over the local reference backends under `store.root`
    pub async fn open_local(store: &StoreConfig) -> CacheResult<Self> {
        let root = &store.root;
        let snapshotter = Arc::new(NativeSnapshotter::open(ConfigManager::snapshots_dir(root)).await?);
        let content = Arc::new(LocalContentStore::open(ConfigManager::content_dir(root)).await?);
        let leases = Arc::new(FileLeaseManager::open(ConfigManager::leases_path(root)).await?);
        let metadata = Arc::new(FileMetadataStore::open(ConfigManager::metadata_dir(root)).await?);
        let mount_pool =
            MountPool::open(ConfigManager::mount_pool_dir(root), store.mount_pool_size).await?;
        let gc = Arc::new(LocalCollector::new(
            snapshotter.clone(),
            content.clone(),
            leases.clone(),
        ));

        Self::open(ManagerOpt {
            snapshotter,
            content,
            leases,
            metadata,
            gc: Some(gc),
            differ: Arc::new(ArchiveDiffer),
            applier: Arc::new(ArchiveDiffer),
            converter: Arc::new(StreamConverter::new()),
            mount_pool,
        })
        .await
    }

    pub fn content(&self) -> Arc<dyn ContentStore> {
        self.inner.content.clone()
    }

    pub fn snapshotter(&self) -> Arc<dyn MergeSnapshotter> {
        self.inner.snapshotter.clone()
    }

    pub fn mount_pool(&self) -> &MountPool {
        &self.inner.mount_pool
    }

    /// Create a writable ref, copying `parent` if given
    pub async fn new_ref(
        &self,
        parent: Option<&ImmutableRef>,
        opts: RecordOptions,
    ) -> CacheResult<MutableRef> {
        self.inner.check_open()?;
        let parent_rec = match parent {
            Some(p) => {
                p.finalize().await?;
                p.extract(&CancellationToken::new()).await?;
                Some(p.rec.clone())
            }
            None => None,
        };

        let id = new_id();
        let parent_key = parent_rec.as_ref().map(|p| p.snapshot_id());
        {
            let _gc = self.inner.gc_lock.read().await;
            self.inner.leases.create(&id, BTreeMap::new()).await?;
            if let Err(e) = self
                .inner
                .snapshotter
                .prepare(&id, parent_key.as_deref())
                .await
            {
                if let Err(le) = self.inner.leases.delete(&id).await {
                    warn!("Dropping lease {} after failed prepare: {}", id, le);
                }
                return Err(e);
            }
            self.inner
                .leases
                .add_resource(&id, Resource::snapshot(&id))
                .await?;
        }

        let mut md = RecordMetadata::new(&id, RecordKind::Active, &id);
        md.parent = parent_rec.as_ref().map(|p| p.id.clone());
        md.description = opts.description;
        md.record_type = opts.record_type;
        md.cache_policy = opts.cache_policy;
        self.inner.persist(&md).await?;

        let rec = CacheRecord::new(
            md,
            match parent_rec {
                Some(p) => Parents::Layer(p),
                None => Parents::None,
            },
        );
        let handle = self.inner.mutable_handle(&rec);
        self.inner.registry.lock().await.insert(rec);
        debug!(
            "Created mutable ref {} (parent: {})",
            id,
            parent_key.as_deref().unwrap_or("none")
        );
        Ok(handle)
    }

    /// Look up a committed ref
    pub async fn get(&self, id: &str) -> CacheResult<ImmutableRef> {
        self.get_with_handlers(id, DescHandlers::new()).await
    }

    /// Look up a committed ref, attaching providers for its lazy blobs
    pub async fn get_with_handlers(
        &self,
        id: &str,
        handlers: DescHandlers,
    ) -> CacheResult<ImmutableRef> {
        self.inner.check_open()?;
        let reg = self.inner.registry.lock().await;
        let rec = reg
            .get(id)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        if rec.is_mutable() {
            if let Some(imm) = rec.equal_immutable().and_then(|imm| reg.get(&imm)) {
                return Ok(self.inner.immutable_handle(&imm, handlers));
            }
            if rec.refs() > 0 {
                return Err(CacheError::locked(id));
            }
            return Err(CacheError::invalid(id, "ref has not been committed"));
        }
        Ok(self.inner.immutable_handle(&rec, handlers))
    }

    /// Check out a mutable ref again
    ///
    /// Fails with `Locked` while the ref or the record committed from it is
    /// held. A committed record that was never finalized is discarded.
    pub async fn get_mutable(&self, id: &str) -> CacheResult<MutableRef> {
        self.inner.check_open()?;
        let mut reg = self.inner.registry.lock().await;
        let rec = reg
            .get(id)
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        if !rec.is_mutable() {
            return Err(CacheError::invalid(id, "ref is immutable"));
        }
        if rec.refs() > 0 {
            return Err(CacheError::locked(id));
        }

        if let Some(imm_id) = rec.equal_immutable() {
            if let Some(imm) = reg.get(&imm_id) {
                if reg.is_held(&imm) {
                    return Err(CacheError::locked(id));
                }
                reg.remove(&imm_id);
                self.inner.forget(&imm_id).await?;
                debug!("Discarded unfinalized ref {} to reopen {}", imm_id, id);
            }
            let md = rec.update_md(|md| md.equal_immutable = None);
            self.inner.persist(&md).await?;
        }
        Ok(self.inner.mutable_handle(&rec))
    }

    /// Ref for a layer blob on top of `parent`
    ///
    /// Returns the existing ref when one already has the same blob chain. The
    /// blob may live only in `handlers`; it is then pulled in when the ref is
    /// first mounted.
    pub async fn get_by_blob(
        &self,
        desc: &Descriptor,
        parent: Option<&ImmutableRef>,
        handlers: DescHandlers,
    ) -> CacheResult<ImmutableRef> {
        self.inner.check_open()?;
        let diff_id = desc.diff_id()?;
        let handlers = match parent {
            Some(p) => p.handlers.merged(&handlers),
            None => handlers,
        };

        let (parent_chain, parent_blob_chain) = match parent {
            Some(p) => {
                p.finalize().await?;
                p.compute_chain_metadata(&mut HashSet::new()).await?;
                let chain = p.rec.chain_id();
                let blob_chain = p.rec.blob_chain_id();
                match (chain, blob_chain) {
                    (Some(c), Some(b)) => (Some(c), Some(b)),
                    _ => return Err(CacheError::invalid(p.id(), "parent has no chain id")),
                }
            }
            None => (None, None),
        };
        let chain_id = digest::chain_id(parent_chain.as_ref(), &diff_id);
        let blob_chain_id = digest::blob_chain_id(parent_blob_chain.as_ref(), &desc.digest, &diff_id);

        match self.inner.content.info(&desc.digest).await {
            Ok(info) => {
                if let Some(actual) = info.uncompressed() {
                    if actual != diff_id {
                        return Err(CacheError::ContentMismatch {
                            expected: diff_id.to_string(),
                            actual: actual.to_string(),
                        });
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                if !handlers.contains(&desc.digest) {
                    return Err(CacheError::ContentNotFound(desc.digest.to_string()));
                }
            }
            Err(e) => return Err(e),
        }

        let _gc = self.inner.gc_lock.read().await;
        let mut reg = self.inner.registry.lock().await;
        if let Some(existing) = reg.find_by_blob_chain(&blob_chain_id) {
            debug!("Reusing ref {} for blob {}", existing.id, desc.digest);
            return Ok(self.inner.immutable_handle(&existing, handlers));
        }

        let (snapshot_id, blob_only) = match reg.find_extracted_chain(&chain_id) {
            Some(same) => (same.snapshot_id(), false),
            None => {
                let key = chain_id.to_string();
                let extracted = snapshot::exists(&*self.inner.snapshotter, &key).await?;
                (key, !extracted)
            }
        };

        let id = new_id();
        self.inner.leases.create(&id, BTreeMap::new()).await?;
        self.inner
            .leases
            .add_resource(&id, Resource::content(&desc.digest))
            .await?;
        if !blob_only {
            self.inner
                .leases
                .add_resource(&id, Resource::snapshot(&snapshot_id))
                .await?;
        }

        let mut md = RecordMetadata::new(&id, RecordKind::Committed, &snapshot_id);
        md.parent = parent.map(|p| p.id().to_string());
        md.blob = Some(desc.clone());
        md.diff_id = Some(diff_id);
        md.chain_id = Some(chain_id);
        md.blob_chain_id = Some(blob_chain_id);
        md.blob_only = blob_only;
        md.description = format!("layer {}", desc.digest);
        self.inner.persist(&md).await?;

        let rec = CacheRecord::new(
            md,
            match parent {
                Some(p) => Parents::Layer(p.rec.clone()),
                None => Parents::None,
            },
        );
        let handle = self.inner.immutable_handle(&rec, handlers);
        reg.insert(rec);
        debug!(
            "Created ref {} for blob {} (lazy: {})",
            id, desc.digest, blob_only
        );
        Ok(handle)
    }

    /// Union of several refs, applied in order
    ///
    /// Merge inputs are flattened and duplicates dropped. No inputs gives
    /// `None`; a single input gives a clone of it.
    pub async fn merge(
        &self,
        inputs: &[&ImmutableRef],
        opts: RecordOptions,
    ) -> CacheResult<Option<ImmutableRef>> {
        self.inner.check_open()?;
        let mut parents: Vec<Arc<CacheRecord>> = vec![];
        let mut seen = HashSet::new();
        let mut handlers = DescHandlers::new();
        for input in inputs {
            input.finalize().await?;
            handlers = handlers.merged(&input.handlers);
            let flattened = match &input.rec.parents {
                Parents::Merge(ps) => ps.clone(),
                _ => vec![input.rec.clone()],
            };
            for p in flattened {
                if seen.insert(p.id.clone()) {
                    parents.push(p);
                }
            }
        }

        match parents.len() {
            0 => Ok(None),
            1 => Ok(Some(self.inner.immutable_handle(&parents[0], handlers))),
            _ => {
                let rec = {
                    let mut reg = self.inner.registry.lock().await;
                    let rec = self
                        .inner
                        .create_synthetic(&mut reg, Parents::Merge(parents), &opts)
                        .await?;
                    rec.acquire();
                    rec
                };
                let handle = ImmutableRef::new(rec, self.inner.clone(), handlers);
                self.inner.try_compute_chain(&handle.rec).await?;
                Ok(Some(handle))
            }
        }
    }

    /// Changes that turn `lower` into `upper`
    ///
    /// When `lower` is a prefix of `upper`'s layers the result is a merge of
    /// one single-layer diff per extra layer.
    pub async fn diff(
        &self,
        lower: Option<&ImmutableRef>,
        upper: Option<&ImmutableRef>,
        opts: RecordOptions,
    ) -> CacheResult<Option<ImmutableRef>> {
        self.inner.check_open()?;
        let (lower, upper) = match (lower, upper) {
            (None, None) => return Ok(None),
            (Some(l), Some(u)) if l.id() == u.id() => return Ok(None),
            (None, Some(u)) => return Ok(Some(u.clone())),
            (l, u) => (l, u),
        };
        let mut handlers = DescHandlers::new();
        for r in lower.iter().chain(upper.iter()) {
            r.finalize().await?;
            handlers = handlers.merged(&r.handlers);
        }

        let lower_chain = lower.map(|l| l.rec.layer_chain()).unwrap_or_default();
        let upper_chain = upper.map(|u| u.rec.layer_chain()).unwrap_or_default();
        let is_prefix = !lower_chain.is_empty()
            && lower_chain.len() < upper_chain.len()
            && lower_chain
                .iter()
                .zip(upper_chain.iter())
                .all(|(l, u)| l.id == u.id);

        let rec = {
            let mut reg = self.inner.registry.lock().await;
            let rec = if is_prefix {
                let mut components = vec![];
                for layer in &upper_chain[lower_chain.len()..] {
                    let component = match &layer.parents {
                        Parents::Layer(p) => {
                            let parents = Parents::Diff {
                                lower: Some(p.clone()),
                                upper: Some(layer.clone()),
                            };
                            self.inner
                                .create_synthetic(&mut reg, parents, &RecordOptions::default())
                                .await?
                        }
                        _ => layer.clone(),
                    };
                    components.push(component);
                }
                if components.len() == 1 {
                    components.remove(0)
                } else {
                    self.inner
                        .create_synthetic(&mut reg, Parents::Merge(components), &opts)
                        .await?
                }
            } else {
                let parents = Parents::Diff {
                    lower: lower.map(|l| l.rec.clone()),
                    upper: upper.map(|u| u.rec.clone()),
                };
                self.inner.create_synthetic(&mut reg, parents, &opts).await?
            };
            rec.acquire();
            rec
        };
        Ok(Some(ImmutableRef::new(rec, self.inner.clone(), handlers)))
    }

    /// Release manager resources; later calls are no-ops
    pub async fn close(&self) -> CacheResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.mount_pool.close().await?;
        info!("Cache manager closed");
        Ok(())
    }
}

impl Inner {
    pub(crate) fn check_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Internal("cache manager is closed".to_string()));
        }
        Ok(())
    }

    pub(crate) fn immutable_handle(
        self: &Arc<Self>,
        rec: &Arc<CacheRecord>,
        handlers: DescHandlers,
    ) -> ImmutableRef {
        rec.acquire();
        ImmutableRef::new(rec.clone(), self.clone(), handlers)
    }

    pub(crate) fn mutable_handle(self: &Arc<Self>, rec: &Arc<CacheRecord>) -> MutableRef {
        rec.acquire();
        MutableRef::new(rec.clone(), self.clone())
    }

    pub(crate) async fn persist(&self, md: &RecordMetadata) -> CacheResult<()> {
        self.metadata.put(md).await
    }

    /// Drop a record's lease and metadata
    pub(crate) async fn forget(&self, id: &str) -> CacheResult<()> {
        self.leases.delete(id).await?;
        self.metadata.delete(id).await
    }

    /// Register a merge or diff record; its snapshot is built on first use
    async fn create_synthetic(
        &self,
        reg: &mut Registry,
        parents: Parents,
        opts: &RecordOptions,
    ) -> CacheResult<Arc<CacheRecord>> {
        let id = new_id();
        let (kind, mut md) = match &parents {
            Parents::Merge(_) => (RecordKind::Merge, RecordMetadata::new(&id, RecordKind::Merge, &id)),
            _ => (RecordKind::Diff, RecordMetadata::new(&id, RecordKind::Diff, &id)),
        };
        match &parents {
            Parents::Merge(ps) => md.merge_parents = ps.iter().map(|p| p.id.clone()).collect(),
            Parents::Diff { lower, upper } => {
                md.diff_lower = lower.as_ref().map(|r| r.id.clone());
                md.diff_upper = upper.as_ref().map(|r| r.id.clone());
            }
            _ => {}
        }
        md.description = if opts.description.is_empty() {
            match kind {
                RecordKind::Merge => format!("merge {}", md.merge_parents.join(" ")),
                _ => format!(
                    "diff {} -> {}",
                    md.diff_lower.as_deref().unwrap_or("scratch"),
                    md.diff_upper.as_deref().unwrap_or("scratch")
                ),
            }
        } else {
            opts.description.clone()
        };
        md.record_type = opts.record_type;

        self.leases.create(&id, BTreeMap::new()).await?;
        self.persist(&md).await?;
        let rec = CacheRecord::new(md, parents);
        reg.insert(rec.clone());
        debug!("Created {:?} ref {}", kind, id);
        Ok(rec)
    }

    /// Compute chain ids for a synthetic record when every layer has a blob
    async fn try_compute_chain(&self, rec: &Arc<CacheRecord>) -> CacheResult<()> {
        let complete = rec
            .layer_chain()
            .iter()
            .all(|l| l.with_md(|md| md.blob.is_some()));
        if complete {
            self.compute_chain(rec, &mut HashSet::new()).await?;
        }
        Ok(())
    }

    /// Complete a commit: the mutable's snapshot becomes the record's own
    pub(crate) async fn finalize(&self, rec: &Arc<CacheRecord>) -> CacheResult<()> {
        if rec.equal_mutable().is_none() {
            return Ok(());
        }
        let _gc = self.gc_lock.read().await;
        let mut reg = self.registry.lock().await;
        let Some(mid) = rec.equal_mutable() else {
            return Ok(());
        };
        let mutable = reg.get(&mid);
        if mutable.as_ref().is_some_and(|m| m.refs() > 0) {
            return Err(CacheError::locked(&mid));
        }
        let active_key = mutable.as_ref().map(|m| m.snapshot_id()).unwrap_or_else(|| mid.clone());
        let snapshot_id = rec.snapshot_id();

        self.snapshotter.commit(&snapshot_id, &active_key).await?;
        self.leases
            .add_resource(&rec.id, Resource::snapshot(&snapshot_id))
            .await?;
        let md = rec.update_md(|md| md.equal_mutable = None);
        self.persist(&md).await?;

        reg.remove(&mid);
        self.forget(&mid).await?;
        info!("Finalized ref {} from mutable {}", rec.id, mid);
        Ok(())
    }

    /// Mounts of a record's current snapshot
    ///
    /// A committed record awaiting finalize reads its mutable's snapshot.
    pub(crate) async fn record_mounts(
        &self,
        rec: &CacheRecord,
        readonly: bool,
    ) -> CacheResult<Vec<Mount>> {
        let key = rec.equal_mutable().unwrap_or_else(|| rec.snapshot_id());
        let mounts = self.snapshotter.mounts(&key).await?;
        Ok(if readonly {
            snapshot::readonly_mounts(mounts)
        } else {
            mounts
        })
    }

    pub(crate) async fn release_immutable(&self, rec: &Arc<CacheRecord>) -> CacheResult<()> {
        let _reg = self.registry.lock().await;
        if rec.release_one() > 0 || rec.is_dead() {
            return Ok(());
        }
        let md = rec.update_md(|md| {
            md.last_used_at = Some(chrono::Utc::now());
            md.usage_count += 1;
        });
        self.persist(&md).await
    }

    /// Release a mutable handle; an uncommitted record without a retain
    /// policy is removed once nobody holds it
    pub(crate) async fn release_mutable(&self, rec: &Arc<CacheRecord>) -> CacheResult<()> {
        let mut reg = self.registry.lock().await;
        if rec.release_one() > 0 || rec.is_dead() {
            return Ok(());
        }
        let keep = rec.with_md(|md| {
            md.cache_policy == crate::metadata::CachePolicy::Retain
                || md.equal_immutable.is_some()
        });
        if keep {
            let md = rec.update_md(|md| md.last_used_at = Some(chrono::Utc::now()));
            return self.persist(&md).await;
        }

        reg.remove(&rec.id);
        let mut errors = vec![];
        if let Err(e) = self.snapshotter.remove(&rec.snapshot_id()).await {
            if !e.is_not_found() {
                errors.push(e);
            }
        }
        if let Err(e) = self.leases.delete(&rec.id).await {
            errors.push(e);
        }
        if let Err(e) = self.metadata.delete(&rec.id).await {
            errors.push(e);
        }
        debug!("Removed uncommitted mutable ref {}", rec.id);
        match CacheError::join(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rebuild the registry from persisted metadata
    ///
    /// Tombstoned records are finished off, interrupted commits are either
    /// completed or rolled back, and records whose parents are gone are
    /// dropped.
    async fn recover(&self) -> CacheResult<()> {
        let mut mds: HashMap<String, RecordMetadata> = HashMap::new();
        for md in self.metadata.list().await? {
            if md.deleted {
                self.forget(&md.id).await?;
                info!("Finished reclaiming ref {}", md.id);
                continue;
            }
            mds.insert(md.id.clone(), md);
        }

        let mut pending: Vec<String> = mds
            .values()
            .filter(|md| md.equal_mutable.is_some())
            .map(|md| md.id.clone())
            .collect();
        pending.sort();
        for id in pending {
            let Some(mid) = mds.get(&id).and_then(|md| md.equal_mutable.clone()) else {
                continue;
            };
            let snapshot_id = mds[&id].snapshot_id.clone();
            if snapshot::exists(&*self.snapshotter, &snapshot_id).await? {
                self.leases.create(&id, BTreeMap::new()).await?;
                self.leases
                    .add_resource(&id, Resource::snapshot(&snapshot_id))
                    .await?;
                if let Some(md) = mds.get_mut(&id) {
                    md.equal_mutable = None;
                    self.metadata.put(md).await?;
                }
                if mds.remove(&mid).is_some() {
                    self.forget(&mid).await?;
                }
                info!("Completed interrupted finalize of ref {}", id);
                continue;
            }

            let mutable_ok = match mds.get(&mid) {
                Some(m) if m.kind == RecordKind::Active => {
                    snapshot::exists(&*self.snapshotter, &m.snapshot_id).await?
                }
                _ => false,
            };
            if mutable_ok {
                if let Some(m) = mds.get_mut(&mid) {
                    if m.equal_immutable.as_deref() != Some(id.as_str()) {
                        m.equal_immutable = Some(id.clone());
                        self.metadata.put(m).await?;
                    }
                }
            } else {
                mds.remove(&id);
                self.forget(&id).await?;
                if mds.remove(&mid).is_some() {
                    self.forget(&mid).await?;
                }
                warn!("Rolled back interrupted commit of ref {}", id);
            }
        }

        let mut ids: Vec<String> = mds.keys().cloned().collect();
        ids.sort();
        for id in &ids {
            let dangling = mds.get(id).and_then(|md| {
                md.equal_immutable
                    .as_ref()
                    .filter(|imm| !mds.contains_key(*imm))
                    .cloned()
            });
            if let Some(imm) = dangling {
                if let Some(md) = mds.get_mut(id) {
                    md.equal_immutable = None;
                    self.metadata.put(md).await?;
                }
                debug!("Cleared dangling link from {} to {}", id, imm);
            }
        }

        for id in &ids {
            let Some(md) = mds.get(id).cloned() else {
                continue;
            };
            let layered = matches!(md.kind, RecordKind::Active | RecordKind::Committed);
            if !layered || md.blob_only || md.equal_mutable.is_some() {
                continue;
            }
            if snapshot::exists(&*self.snapshotter, &md.snapshot_id).await? {
                continue;
            }
            if md.kind == RecordKind::Committed && md.blob.is_some() {
                if let Some(md) = mds.get_mut(id) {
                    md.blob_only = true;
                    self.metadata.put(md).await?;
                }
                warn!("Snapshot of ref {} is gone; content will be pulled again", id);
            } else {
                mds.remove(id);
                self.forget(id).await?;
                warn!("Dropped ref {}: snapshot {} is gone", id, md.snapshot_id);
            }
        }

        let mut records = HashMap::new();
        let mut dropped = HashSet::new();
        for id in &ids {
            resolve(id, &mds, &mut records, &mut dropped, &mut HashSet::new());
        }
        let mut dropped: Vec<String> = dropped.into_iter().collect();
        dropped.sort();
        for id in dropped {
            self.forget(&id).await?;
            warn!("Dropped ref {}: a parent is missing", id);
        }

        self.registry.lock().await.records = records;
        Ok(())
    }
}

/// Build the record for `id`, parents first
fn resolve(
    id: &str,
    mds: &HashMap<String, RecordMetadata>,
    records: &mut HashMap<String, Arc<CacheRecord>>,
    dropped: &mut HashSet<String>,
    visiting: &mut HashSet<String>,
) -> Option<Arc<CacheRecord>> {
    if let Some(rec) = records.get(id) {
        return Some(rec.clone());
    }
    if dropped.contains(id) {
        return None;
    }
    let md = mds.get(id)?;
    if !visiting.insert(id.to_string()) {
        dropped.insert(id.to_string());
        return None;
    }

    let mut lookup = |pid: &str| resolve(pid, mds, records, dropped, visiting);
    let parents = match md.kind {
        RecordKind::Active | RecordKind::Committed => match &md.parent {
            None => Some(Parents::None),
            Some(p) => lookup(p.as_str()).map(Parents::Layer),
        },
        RecordKind::Merge => md
            .merge_parents
            .iter()
            .map(|p| lookup(p.as_str()))
            .collect::<Option<Vec<_>>>()
            .map(Parents::Merge),
        RecordKind::Diff => {
            let lower = md.diff_lower.as_deref().map(&mut lookup);
            let upper = md.diff_upper.as_deref().map(&mut lookup);
            match (lower, upper) {
                (Some(None), _) | (_, Some(None)) => None,
                (lower, upper) => Some(Parents::Diff {
                    lower: lower.flatten(),
                    upper: upper.flatten(),
                }),
            }
        }
    };
    visiting.remove(id);

    match parents {
        Some(parents) => {
            let rec = CacheRecord::new(md.clone(), parents);
            records.insert(id.to_string(), rec.clone());
            Some(rec)
        }
        None => {
            dropped.insert(id.to_string());
            None
        }
    }
}
