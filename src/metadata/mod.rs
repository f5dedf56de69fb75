//! Persisted cache record metadata
//!
//! The metadata store is the source of truth for every record across
//! restarts; the in-memory registry is rebuilt from it on startup.

pub mod file;

pub use file::FileMetadataStore;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a record represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Writable snapshot
    Active,
    /// Read-only layer on top of an optional parent
    Committed,
    /// Union of several parent chains
    Merge,
    /// Difference between two chains
    Diff,
}

/// Whether a record survives the release of its last handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    #[default]
    Default,
    Retain,
}

/// Category reported by disk usage and matched by prune filters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    #[default]
    #[serde(rename = "regular")]
    Regular,
    #[serde(rename = "internal")]
    Internal,
    #[serde(rename = "frontend")]
    Frontend,
    #[serde(rename = "source.local")]
    LocalSource,
    #[serde(rename = "exec.cachemount")]
    CacheMount,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Internal => "internal",
            Self::Frontend => "frontend",
            Self::LocalSource => "source.local",
            Self::CacheMount => "exec.cachemount",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(Self::Regular),
            "internal" => Ok(Self::Internal),
            "frontend" => Ok(Self::Frontend),
            "source.local" => Ok(Self::LocalSource),
            "exec.cachemount" => Ok(Self::CacheMount),
            other => Err(CacheError::invalid(
                other,
                "unknown record type (expected regular, internal, frontend, source.local or exec.cachemount)",
            )),
        }
    }
}

/// Everything persisted about one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub id: String,

    pub kind: RecordKind,

    /// Key of the backing snapshot
    pub snapshot_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_parents: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_lower: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_upper: Option<String>,

    /// On a committed record: the mutable record still owning the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equal_mutable: Option<String>,

    /// On a mutable record: the committed record awaiting finalize
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equal_immutable: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<Digest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<Digest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_chain_id: Option<Digest>,

    /// Content only exists as a blob; the snapshot has not been extracted
    #[serde(default)]
    pub blob_only: bool,

    /// Tombstone written before reclamation
    #[serde(default)]
    pub deleted: bool,

    #[serde(default)]
    pub cache_policy: CachePolicy,

    #[serde(default)]
    pub record_type: RecordType,

    #[serde(default)]
    pub description: String,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub usage_count: u64,

    /// Cached disk usage of the snapshot, once it can no longer change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl RecordMetadata {
    pub fn new(id: impl Into<String>, kind: RecordKind, snapshot_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            snapshot_id: snapshot_id.into(),
            parent: None,
            merge_parents: Vec::new(),
            diff_lower: None,
            diff_upper: None,
            equal_mutable: None,
            equal_immutable: None,
            blob: None,
            diff_id: None,
            chain_id: None,
            blob_chain_id: None,
            blob_only: false,
            deleted: false,
            cache_policy: CachePolicy::Default,
            record_type: RecordType::Regular,
            description: String::new(),
            created_at: Utc::now(),
            last_used_at: None,
            usage_count: 0,
            size: None,
        }
    }

    /// Ids of every record this one depends on
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self.parent.iter().cloned().collect();
        deps.extend(self.merge_parents.iter().cloned());
        deps.extend(self.diff_lower.iter().cloned());
        deps.extend(self.diff_upper.iter().cloned());
        deps
    }
}

/// Storage for record metadata
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, id: &str) -> CacheResult<Option<RecordMetadata>>;

    /// Insert or replace a record
    async fn put(&self, md: &RecordMetadata) -> CacheResult<()>;

    /// Remove a record; removing a missing record is not an error
    async fn delete(&self, id: &str) -> CacheResult<()>;

    async fn list(&self) -> CacheResult<Vec<RecordMetadata>>;
}
