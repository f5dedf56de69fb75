//! Blob re-encoding between compression types

use super::Compression;
use crate::content::{blob_labels, ContentStore, ContentWriter, Provider};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::io::Write;
use tracing::debug;

/// Produces an alternate encoding of a layer blob
#[async_trait]
pub trait Converter: Send + Sync {
    /// Re-encode `desc` as `to`, storing the result in `store`
    ///
    /// Returns `None` when the blob is already encoded as `to`.
    async fn convert(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
        to: Compression,
        level: Option<i32>,
    ) -> CacheResult<Option<Descriptor>>;
}

/// Converter that decodes and re-encodes whole blobs in memory
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamConverter;

impl StreamConverter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Converter for StreamConverter {
    async fn convert(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
        to: Compression,
        level: Option<i32>,
    ) -> CacheResult<Option<Descriptor>> {
        let from = Compression::from_descriptor(desc)?;
        if from == to {
            return Ok(None);
        }
        if to == Compression::EStargz {
            return Err(CacheError::UnsupportedCompression(
                "estargz encoding requires an external converter".to_string(),
            ));
        }

        let reader = store.reader_at(desc).await?;
        let blob = reader.as_bytes().to_vec();
        let (uncompressed_digest, encoded) = tokio::task::spawn_blocking(move || {
            let uncompressed = from.decode(&blob)?;
            let digest = Digest::from_bytes(&uncompressed);
            let encoded = to.encode(&uncompressed, level)?;
            Ok::<_, CacheError>((digest, encoded))
        })
        .await
        .map_err(|e| CacheError::Internal(format!("conversion task failed: {}", e)))??;

        if let Some(expected) = desc.uncompressed_digest()? {
            if expected != uncompressed_digest {
                return Err(CacheError::ContentMismatch {
                    expected: expected.to_string(),
                    actual: uncompressed_digest.to_string(),
                });
            }
        }

        let size = encoded.len() as u64;
        let mut writer = ContentWriter::new(store, format!("convert-{}-{}", desc.digest.encoded(), to));
        writer
            .write_all(&encoded)
            .map_err(|e| CacheError::io("buffering converted blob", e))?;
        let info = writer
            .commit(None, blob_labels(to.media_type(), &uncompressed_digest))
            .await?;

        debug!(
            "Converted {} from {} to {} as {}",
            desc.digest, from, to, info.digest
        );

        Ok(Some(
            Descriptor::new(to.media_type(), info.digest, size)
                .with_uncompressed(&uncompressed_digest),
        ))
    }
}
