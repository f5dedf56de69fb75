//! snapcache - content-addressable build cache and snapshot refs
//!
//! Tracks filesystem snapshots as reference-counted cache records that can
//! be layered, merged, diffed, exported as compressed layer blobs and
//! reclaimed when unused.

pub mod archive;
pub mod cache;
pub mod cli;
pub mod compression;
pub mod config;
pub mod content;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod gc;
pub mod lease;
pub mod metadata;
pub mod snapshot;

pub use cache::{ImmutableRef, Manager, ManagerOpt, MutableRef};
pub use error::{CacheError, CacheResult};
