//! Error types for snapcache
//!
//! All modules use `CacheResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for snapcache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors that can occur in snapcache
#[derive(Error, Debug)]
pub enum CacheError {
    // Ref errors
    #[error("ref {id} is locked")]
    Locked { id: String },

    #[error("ref not found: {0}")]
    NotFound(String),

    #[error("invalid ref {id}: {reason}")]
    Invalid { id: String, reason: String },

    #[error("content mismatch: expected uncompressed digest {expected}, got {actual}")]
    ContentMismatch { expected: String, actual: String },

    #[error("lazy content unavailable for {0}: no provider registered")]
    LazyContentUnavailable(String),

    // Snapshotter errors
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("snapshot already exists: {0}")]
    SnapshotExists(String),

    #[error("snapshot {key} cannot be removed: {reason}")]
    SnapshotInUse { key: String, reason: String },

    #[error("unsupported mount: {0}")]
    UnsupportedMount(String),

    // Content errors
    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("invalid digest: {0}")]
    DigestInvalid(String),

    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("layer archive error: {context}")]
    Archive {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create directory {path}: {source}")]
    DirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("{}", join_messages(.0))]
    Aggregate(Vec<CacheError>),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_messages(errors: &[CacheError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a layer archive error with context
    pub fn archive(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Archive {
            context: context.into(),
            source,
        }
    }

    /// Create an invalid-state error for a ref
    pub fn invalid(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a locked error for a ref
    pub fn locked(id: impl Into<String>) -> Self {
        Self::Locked { id: id.into() }
    }

    /// Fold a list of teardown errors into one, if there are any
    pub fn join(mut errors: Vec<CacheError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(errors)),
        }
    }

    /// Check if error denotes something missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::SnapshotNotFound(_) | Self::ContentNotFound(_)
        )
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Locked { .. } | Self::LazyContentUnavailable(_) | Self::Cancelled
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Locked { .. } => Some("Another build step holds this ref; retry once it is released"),
            Self::LazyContentUnavailable(_) => {
                Some("Supply a descriptor handler for the blob or pull the image again")
            }
            Self::ConfigInvalid { .. } => Some("Run: snapcache config show"),
            Self::SnapshotInUse { .. } => Some("Prune dependent refs first: snapcache prune --all"),
            _ => None,
        }
    }
}
