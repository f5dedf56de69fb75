//! Options and reports exchanged with the manager

use crate::compression::Compression;
use crate::content::Provider;
use crate::digest::Digest;
use crate::metadata::{CachePolicy, RecordType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Per-digest providers used to fault in lazy blobs
///
/// Handlers travel with the refs created from them, so a child ref can still
/// fetch its parent's layers.
#[derive(Clone, Default)]
pub struct DescHandlers(Arc<HashMap<Digest, Arc<dyn Provider>>>);

impl DescHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` as the source for `digest`
    pub fn with(self, digest: Digest, provider: Arc<dyn Provider>) -> Self {
        let mut map = Arc::unwrap_or_clone(self.0);
        map.insert(digest, provider);
        Self(Arc::new(map))
    }

    pub fn get(&self, digest: &Digest) -> Option<Arc<dyn Provider>> {
        self.0.get(digest).cloned()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.0.contains_key(digest)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union of both handler sets; entries in `other` win
    pub fn merged(&self, other: &DescHandlers) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut map = (*self.0).clone();
        map.extend(other.0.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));
        Self(Arc::new(map))
    }
}

impl fmt::Debug for DescHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Options for a freshly created record
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    pub description: String,
    pub record_type: RecordType,
    /// `Retain` keeps an uncommitted mutable record after its last release
    pub cache_policy: CachePolicy,
}

impl RecordOptions {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

/// How a ref's layers should be encoded for export
#[derive(Debug, Clone, Default)]
pub struct RefConfig {
    pub compression: Compression,
    pub level: Option<i32>,
    /// Convert existing blobs that use another compression
    pub force: bool,
    /// Keep non-distributable media types and their urls
    pub prefer_non_distributable: bool,
}

/// One record as reported by disk usage and prune
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageInfo {
    pub id: String,
    pub mutable: bool,
    pub in_use: bool,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub parents: Vec<String>,
    pub description: String,
    pub record_type: RecordType,
    pub shared: bool,
}

/// Selection of records to reclaim
#[derive(Debug, Clone, Default)]
pub struct PruneInfo {
    /// Include internal records
    pub all: bool,
    /// `id==X`, `id~=prefix` or `type==T`; every filter must match
    pub filters: Vec<String>,
    /// Keep records used within this window
    pub keep_duration: Option<Duration>,
    /// Stop once unused records fit in this many bytes; zero disables
    pub keep_bytes: u64,
    /// Report what would be reclaimed without deleting anything
    pub dry_run: bool,
}
