//! In-memory blob provider

use super::{Provider, ReaderAt};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Serves blobs held in memory, keyed by digest
///
/// Used as the byte source behind descriptor handlers for lazy refs.
#[derive(Debug, Default, Clone)]
pub struct MemoryProvider {
    blobs: Arc<RwLock<HashMap<Digest, Arc<Vec<u8>>>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob and return its digest
    pub fn insert(&self, bytes: Vec<u8>) -> Digest {
        let digest = Digest::from_bytes(&bytes);
        self.blobs.write().insert(digest.clone(), Arc::new(bytes));
        digest
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.read().contains_key(digest)
    }

    pub fn remove(&self, digest: &Digest) -> bool {
        self.blobs.write().remove(digest).is_some()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn reader_at(&self, desc: &Descriptor) -> CacheResult<ReaderAt> {
        self.blobs
            .read()
            .get(&desc.digest)
            .cloned()
            .map(ReaderAt::new)
            .ok_or_else(|| CacheError::ContentNotFound(desc.digest.to_string()))
    }
}
