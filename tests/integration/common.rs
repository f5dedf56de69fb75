//! Shared fixtures: a temporary store and helpers for building layers

use snapcache::archive::diff_dirs;
use snapcache::cache::{DescHandlers, ImmutableRef, Manager, MutableRef, RecordOptions};
use snapcache::compression::Compression;
use snapcache::config::StoreConfig;
use snapcache::content::MemoryProvider;
use snapcache::descriptor::Descriptor;
use snapcache::digest::Digest;
use snapcache::snapshot::mount_path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Store {
    pub dir: TempDir,
    pub config: StoreConfig,
}

pub fn store() -> Store {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        root: dir.path().join("store"),
        mount_pool_size: 4,
    };
    Store { dir, config }
}

pub async fn open(store: &Store) -> Manager {
    Manager::open_local(&store.config).await.unwrap()
}

pub async fn write_file(r: &MutableRef, rel: &str, content: &str) {
    let mounts = r.mount(false).await.unwrap();
    let path = mount_path(&mounts).unwrap().join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub async fn remove_file(r: &MutableRef, rel: &str) {
    let mounts = r.mount(false).await.unwrap();
    std::fs::remove_file(mount_path(&mounts).unwrap().join(rel)).unwrap();
}

pub async fn read_file(r: &ImmutableRef, rel: &str) -> Option<String> {
    let mounts = r.mount(true).await.unwrap();
    std::fs::read_to_string(mount_path(&mounts).unwrap().join(rel)).ok()
}

/// Committed and finalized ref holding `files`, optionally on top of `parent`
pub async fn committed(
    m: &Manager,
    parent: Option<&ImmutableRef>,
    files: &[(&str, &str)],
) -> ImmutableRef {
    let mref = m
        .new_ref(parent, RecordOptions::described("test layer"))
        .await
        .unwrap();
    for (rel, content) in files {
        write_file(&mref, rel, content).await;
    }
    let imm = mref.commit().await.unwrap();
    imm.finalize().await.unwrap();
    imm
}

/// Uncompressed tar layer containing `files`
pub fn layer_tar(files: &[(&str, &str)]) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    for (rel, content) in files {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    diff_dirs(None, Some(dir.path())).unwrap()
}

/// Encode `tar` and describe the result
pub fn layer_blob(tar: &[u8], compression: Compression) -> (Descriptor, Vec<u8>) {
    let blob = compression.encode(tar, None).unwrap();
    let desc = Descriptor::new(
        compression.media_type(),
        Digest::from_bytes(&blob),
        blob.len() as u64,
    )
    .with_uncompressed(&Digest::from_bytes(tar));
    (desc, blob)
}

/// Handlers serving every blob in `blobs` from memory
pub fn memory_handlers(blobs: &[Vec<u8>]) -> (Arc<MemoryProvider>, DescHandlers) {
    let provider = Arc::new(MemoryProvider::new());
    let mut handlers = DescHandlers::new();
    for blob in blobs {
        let digest = provider.insert(blob.clone());
        handlers = handlers.with(digest, provider.clone());
    }
    (provider, handlers)
}
