//! Exporting refs as descriptor chains

use super::manager::Inner;
use super::options::{DescHandlers, RefConfig};
use super::record::{CacheRecord, Parents};
use crate::compression::{distributable_media_type, is_non_distributable, Compression};
use crate::content::{blob_labels, ContentStore, Provider, ReaderAt};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{CacheError, CacheResult};
use crate::lease::Resource;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A ref's layers as descriptors, base first, plus a source for their bytes
#[derive(Clone)]
pub struct Remote {
    pub descriptors: Vec<Descriptor>,
    pub provider: Arc<dyn Provider>,
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}

/// Serves blobs from the content store, falling back to descriptor handlers
struct RemoteProvider {
    content: Arc<dyn ContentStore>,
    handlers: DescHandlers,
}

#[async_trait]
impl Provider for RemoteProvider {
    async fn reader_at(&self, desc: &Descriptor) -> CacheResult<ReaderAt> {
        match self.content.reader_at(desc).await {
            Err(e) if e.is_not_found() => match self.handlers.get(&desc.digest) {
                Some(provider) => provider.reader_at(desc).await,
                None => Err(CacheError::LazyContentUnavailable(desc.digest.to_string())),
            },
            other => other,
        }
    }
}

impl Inner {
    pub(crate) async fn get_remotes(
        &self,
        rec: &Arc<CacheRecord>,
        handlers: &DescHandlers,
        create_if_needed: bool,
        cfg: &RefConfig,
        all_variants: bool,
        cancel: &CancellationToken,
    ) -> CacheResult<Vec<Remote>> {
        self.finalize(rec).await?;
        let chain = rec.layer_chain();
        for layer in &chain {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            self.ensure_blob(layer, handlers, create_if_needed, cfg, cancel)
                .await?;
        }
        self.compute_chain(rec, &mut HashSet::new()).await?;

        let mut preferred = Vec::with_capacity(chain.len());
        for layer in &chain {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            preferred.push(
                self.preferred_blob(layer, handlers, create_if_needed, cfg)
                    .await?,
            );
        }

        let mut remotes = vec![self.remote(preferred.clone(), cfg, handlers)];
        if all_variants {
            for &compression in Compression::all() {
                if compression == Compression::EStargz {
                    continue;
                }
                let mut descs = Vec::with_capacity(chain.len());
                for layer in &chain {
                    match self.get_blob_with_compression(layer, compression).await {
                        Ok(desc) => descs.push(desc),
                        Err(e) if e.is_not_found() => break,
                        Err(e) => return Err(e),
                    }
                }
                let complete = descs.len() == chain.len();
                let is_new = !remotes
                    .iter()
                    .any(|r| same_digests(&r.descriptors, &descs));
                if complete && is_new {
                    remotes.push(self.remote(descs, cfg, handlers));
                }
            }
        }
        Ok(remotes)
    }

    /// Give a layer a blob, computing one from its snapshot if allowed
    async fn ensure_blob(
        &self,
        layer: &Arc<CacheRecord>,
        handlers: &DescHandlers,
        create_if_needed: bool,
        cfg: &RefConfig,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        if layer.with_md(|md| md.blob.is_some()) {
            return Ok(());
        }
        if !create_if_needed {
            return Err(CacheError::NotFound(format!("blob for ref {}", layer.id)));
        }
        if cfg.compression == Compression::EStargz {
            return Err(CacheError::UnsupportedCompression(cfg.compression.to_string()));
        }

        let _key = self.conversions.lock(format!("blob:{}", layer.id)).await;
        if layer.with_md(|md| md.blob.is_some()) {
            return Ok(());
        }

        let (lower, upper) = match &layer.parents {
            Parents::Layer(p) => (Some(p), Some(layer)),
            Parents::None => (None, Some(layer)),
            Parents::Diff { lower, upper } => (lower.as_ref(), upper.as_ref()),
            Parents::Merge(_) => {
                return Err(CacheError::invalid(&layer.id, "merge ref is not a single layer"))
            }
        };
        for r in lower.iter().chain(upper.iter()) {
            self.ensure_materialized(r, handlers, cancel).await?;
        }
        let lower_mounts = match lower {
            Some(r) => Some(self.record_mounts(r, true).await?),
            None => None,
        };
        let upper_mounts = match upper {
            Some(r) => Some(self.record_mounts(r, true).await?),
            None => None,
        };

        let tar = tokio::select! {
            r = self.differ.compare(lower_mounts.as_deref(), upper_mounts.as_deref()) => r?,
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        };
        let diff_id = Digest::from_bytes(&tar);
        let compression = cfg.compression;
        let level = cfg.level;
        let blob = tokio::task::spawn_blocking(move || compression.encode(&tar, level))
            .await
            .map_err(|e| CacheError::Internal(format!("encoding task failed: {}", e)))??;

        let media_type = compression.media_type();
        let desc = {
            let _gc = self.gc_lock.read().await;
            let info = self
                .content
                .write(
                    &format!("layer-{}", layer.id),
                    blob,
                    None,
                    blob_labels(media_type, &diff_id),
                )
                .await?;
            self.leases
                .add_resource(&layer.id, Resource::content(&info.digest))
                .await?;
            Descriptor::new(media_type, info.digest, info.size).with_uncompressed(&diff_id)
        };
        info!(
            "Computed {} blob {} for ref {}",
            compression, desc.digest, layer.id
        );
        self.set_blob(layer, desc).await
    }

    /// The layer's blob in the requested compression where possible
    async fn preferred_blob(
        &self,
        layer: &Arc<CacheRecord>,
        handlers: &DescHandlers,
        create_if_needed: bool,
        cfg: &RefConfig,
    ) -> CacheResult<Descriptor> {
        let base = layer
            .with_md(|md| md.blob.clone())
            .ok_or_else(|| CacheError::NotFound(format!("blob for ref {}", layer.id)))?;
        if Compression::from_descriptor(&base).ok() == Some(cfg.compression) {
            return Ok(base);
        }
        match self.get_blob_with_compression(layer, cfg.compression).await {
            Ok(desc) => return Ok(desc),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if !(cfg.force && create_if_needed) {
            return Ok(base);
        }
        self.convert_layer(layer, &base, handlers, cfg).await
    }

    /// Convert the layer's blob, once per blob and target compression
    async fn convert_layer(
        &self,
        layer: &Arc<CacheRecord>,
        base: &Descriptor,
        handlers: &DescHandlers,
        cfg: &RefConfig,
    ) -> CacheResult<Descriptor> {
        let _key = self
            .conversions
            .lock(format!("{}@{}", base.digest, cfg.compression))
            .await;
        match self.get_blob_with_compression(layer, cfg.compression).await {
            Ok(desc) => return Ok(desc),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.fetch_blob(base, handlers).await?;

        let _gc = self.gc_lock.read().await;
        let converted = self
            .converter
            .convert(&*self.content, base, cfg.compression, cfg.level)
            .await?;
        match converted {
            None => Ok(base.clone()),
            Some(desc) => {
                self.link_blob_locked(layer, &desc).await?;
                info!(
                    "Converted blob {} to {} as {}",
                    base.digest, cfg.compression, desc.digest
                );
                Ok(desc)
            }
        }
    }

    fn remote(&self, descs: Vec<Descriptor>, cfg: &RefConfig, handlers: &DescHandlers) -> Remote {
        let descriptors = descs
            .into_iter()
            .map(|mut desc| {
                if is_non_distributable(&desc.media_type) && !cfg.prefer_non_distributable {
                    debug!("Exporting {} as distributable", desc.digest);
                    desc.media_type = distributable_media_type(&desc.media_type);
                    desc.urls.clear();
                }
                desc
            })
            .collect();
        Remote {
            descriptors,
            provider: Arc::new(RemoteProvider {
                content: self.content.clone(),
                handlers: handlers.clone(),
            }),
        }
    }
}

fn same_digests(a: &[Descriptor], b: &[Descriptor]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.digest == y.digest)
}
