//! Content store abstraction
//!
//! Blobs are addressed by digest and carry a small label map. Labels record
//! the uncompressed digest, the media type, and the edges of the compression
//! variant index (`snapcache.io/blob/variant.<digest>`).

pub mod buffer;
pub mod local;

pub use buffer::MemoryProvider;
pub use local::LocalContentStore;

use crate::descriptor::{labels, Descriptor};
use crate::digest::{Digest, Digester};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Metadata about a stored blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub digest: Digest,
    pub size: u64,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Info {
    /// Digests this blob links to as alternate encodings
    pub fn variants(&self) -> Vec<Digest> {
        self.labels
            .iter()
            .filter(|(k, _)| k.starts_with(labels::VARIANT_PREFIX))
            .filter_map(|(_, v)| Digest::parse(v).ok())
            .collect()
    }

    /// Uncompressed digest label, if present and valid
    pub fn uncompressed(&self) -> Option<Digest> {
        self.labels
            .get(labels::UNCOMPRESSED)
            .and_then(|v| Digest::parse(v).ok())
    }

    /// Rebuild a descriptor from stored labels
    pub fn descriptor(&self) -> Option<Descriptor> {
        let media_type = self.labels.get(labels::MEDIA_TYPE)?;
        let mut desc = Descriptor::new(media_type.clone(), self.digest.clone(), self.size);
        if let Some(diff_id) = self.uncompressed() {
            desc = desc.with_uncompressed(&diff_id);
        }
        Some(desc)
    }
}

/// Random access view of a blob's bytes
#[derive(Debug, Clone)]
pub struct ReaderAt {
    bytes: Arc<Vec<u8>>,
}

impl ReaderAt {
    pub fn new(bytes: Arc<Vec<u8>>) -> Self {
        Self { bytes }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Copy bytes starting at `offset` into `buf`, returning how many were read
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let start = (offset as usize).min(self.bytes.len());
        let n = buf.len().min(self.bytes.len() - start);
        buf[..n].copy_from_slice(&self.bytes[start..start + n]);
        n
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Supplies blob bytes for a descriptor
///
/// Descriptor handlers hand one of these to the cache so lazy refs can be
/// faulted in on demand.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Open the blob described by `desc`
    async fn reader_at(&self, desc: &Descriptor) -> CacheResult<ReaderAt>;
}

/// Persistent blob storage
#[async_trait]
pub trait ContentStore: Provider {
    /// Look up a blob's metadata
    async fn info(&self, digest: &Digest) -> CacheResult<Info>;

    /// Store a blob, verifying `expected` if given. Writing a blob that already
    /// exists only merges labels.
    async fn write(
        &self,
        reference: &str,
        bytes: Vec<u8>,
        expected: Option<&Digest>,
        labels: BTreeMap<String, String>,
    ) -> CacheResult<Info>;

    /// Merge labels into a blob's label map; an empty value removes the label
    async fn update_labels(
        &self,
        digest: &Digest,
        labels: BTreeMap<String, String>,
    ) -> CacheResult<Info>;

    /// Remove a blob
    async fn delete(&self, digest: &Digest) -> CacheResult<()>;

    /// List every stored blob
    async fn walk(&self) -> CacheResult<Vec<Info>>;
}

/// Whether the store holds `digest`
pub async fn exists(store: &dyn ContentStore, digest: &Digest) -> CacheResult<bool> {
    match store.info(digest).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Buffered writer for a single blob
///
/// Bytes are hashed as they arrive; `commit` stores them under the computed
/// digest.
pub struct ContentWriter<'a> {
    store: &'a dyn ContentStore,
    reference: String,
    buf: Vec<u8>,
    digester: Digester,
}

impl<'a> ContentWriter<'a> {
    pub fn new(store: &'a dyn ContentStore, reference: impl Into<String>) -> Self {
        Self {
            store,
            reference: reference.into(),
            buf: Vec::new(),
            digester: Digester::new(),
        }
    }

    /// Digest of everything written so far
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(&self.buf)
    }

    pub async fn commit(
        self,
        expected: Option<&Digest>,
        labels: BTreeMap<String, String>,
    ) -> CacheResult<Info> {
        let actual = self.digester.finish();
        if let Some(expected) = expected {
            if *expected != actual {
                return Err(CacheError::DigestInvalid(format!(
                    "{}: expected {}, wrote {}",
                    self.reference, expected, actual
                )));
            }
        }
        self.store
            .write(&self.reference, self.buf, Some(&actual), labels)
            .await
    }
}

impl std::io::Write for ContentWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.digester.update(buf);
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Label map for a freshly written layer blob
pub fn blob_labels(media_type: &str, diff_id: &Digest) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MEDIA_TYPE.to_string(), media_type.to_string()),
        (labels::UNCOMPRESSED.to_string(), diff_id.to_string()),
    ])
}

/// Label key linking to a variant blob
pub fn variant_label(digest: &Digest) -> String {
    format!("{}{}", labels::VARIANT_PREFIX, digest.encoded())
}
