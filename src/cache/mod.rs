//! Snapshot reference cache
//!
//! Tracks every layer snapshot known to the build engine as a record with a
//! content identity, hands out reference-counted handles to them, and
//! reclaims what nobody uses any more.
//!
//! # Record States
//!
//! | State | Handle | Description |
//! |-------|--------|-------------|
//! | Active | `MutableRef` | Writable snapshot, at most one handle |
//! | Pending | `ImmutableRef` | Committed, still reading the mutable's snapshot |
//! | Committed | `ImmutableRef` | Finalized read-only snapshot |
//! | Lazy | `ImmutableRef` | Committed, content only exists as a blob |
//! | Merge / Diff | `ImmutableRef` | Synthesized from other records on first mount |
//!
//! Records are persisted through a `MetadataStore`; the in-memory registry
//! is rebuilt from it when the manager opens.

mod blobs;
mod manager;
mod materialize;
mod options;
mod prune;
mod record;
mod refs;
mod remotes;

pub use manager::{Manager, ManagerOpt};
pub use options::{DescHandlers, PruneInfo, RecordOptions, RefConfig, UsageInfo};
pub use refs::{ImmutableRef, MutableRef};
pub use remotes::Remote;
