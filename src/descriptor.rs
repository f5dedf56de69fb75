//! Content descriptors and well-known labels

use crate::digest::Digest;
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label keys shared by descriptors and content-store entries
pub mod labels {
    /// Digest of the uncompressed layer contents (the diff id)
    pub const UNCOMPRESSED: &str = "containerd.io/uncompressed";
    /// Media type recorded on a stored blob
    pub const MEDIA_TYPE: &str = "snapcache.io/blob/mediatype";
    /// Prefix of labels linking a blob to another encoding of the same content
    pub const VARIANT_PREFIX: &str = "snapcache.io/blob/variant.";
    /// Prefix of labels that keep other content alive during gc
    pub const GC_REF_PREFIX: &str = "snapcache.io/gc.ref.";
}

/// Describes one piece of content: a layer blob, in practice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,

    pub digest: Digest,

    pub size: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Alternate locations; only meaningful for non-distributable layers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Descriptor {
    /// Create a descriptor without annotations
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: BTreeMap::new(),
            urls: Vec::new(),
        }
    }

    /// Attach the uncompressed digest annotation
    pub fn with_uncompressed(mut self, diff_id: &Digest) -> Self {
        self.annotations
            .insert(labels::UNCOMPRESSED.to_string(), diff_id.to_string());
        self
    }

    /// The declared uncompressed digest, if annotated
    pub fn uncompressed_digest(&self) -> CacheResult<Option<Digest>> {
        self.annotations
            .get(labels::UNCOMPRESSED)
            .map(|s| Digest::parse(s))
            .transpose()
    }

    /// The declared uncompressed digest, required
    pub fn diff_id(&self) -> CacheResult<Digest> {
        self.uncompressed_digest()?.ok_or_else(|| {
            CacheError::invalid(
                self.digest.to_string(),
                "descriptor has no uncompressed digest annotation",
            )
        })
    }
}
