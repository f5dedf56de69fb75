//! Mark-and-sweep collection of snapshots and blobs
//!
//! Roots are the resources named by leases. From there marking follows
//! snapshot parents and the `gc.ref` / variant labels on blobs. Variant labels
//! form cycles, so every traversal keeps a visited set.

use crate::content::{ContentStore, Info};
use crate::descriptor::labels;
use crate::digest::Digest;
use crate::error::CacheResult;
use crate::lease::{LeaseManager, ResourceKind};
use crate::snapshot::Snapshotter;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one collection pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
    pub snapshots_removed: usize,
    pub blobs_removed: usize,
    pub bytes_reclaimed: u64,
}

/// Physically reclaims storage no lease protects
#[async_trait]
pub trait GarbageCollector: Send + Sync {
    async fn collect(&self) -> CacheResult<GcStats>;
}

/// Collector over the local snapshotter, content store and lease file
pub struct LocalCollector {
    snapshotter: Arc<dyn Snapshotter>,
    content: Arc<dyn ContentStore>,
    leases: Arc<dyn LeaseManager>,
}

impl LocalCollector {
    pub fn new(
        snapshotter: Arc<dyn Snapshotter>,
        content: Arc<dyn ContentStore>,
        leases: Arc<dyn LeaseManager>,
    ) -> Self {
        Self {
            snapshotter,
            content,
            leases,
        }
    }
}

fn referenced_blobs(info: &Info) -> impl Iterator<Item = Digest> + '_ {
    info.labels
        .iter()
        .filter(|(k, _)| {
            k.starts_with(labels::GC_REF_PREFIX) || k.starts_with(labels::VARIANT_PREFIX)
        })
        .filter_map(|(_, v)| Digest::parse(v).ok())
}

#[async_trait]
impl GarbageCollector for LocalCollector {
    async fn collect(&self) -> CacheResult<GcStats> {
        let mut live_snapshots = HashSet::new();
        let mut live_blobs = HashSet::new();
        for lease in self.leases.list().await? {
            for resource in lease.resources {
                match resource.kind {
                    ResourceKind::Snapshot => {
                        live_snapshots.insert(resource.id);
                    }
                    ResourceKind::Content => match Digest::parse(&resource.id) {
                        Ok(d) => {
                            live_blobs.insert(d);
                        }
                        Err(e) => warn!("Ignoring lease {} resource: {}", lease.id, e),
                    },
                }
            }
        }

        // Snapshots: keep every ancestor of a live snapshot
        let snapshots = self.snapshotter.walk().await?;
        let parents: HashMap<String, Option<String>> = snapshots
            .iter()
            .map(|s| (s.key.clone(), s.parent.clone()))
            .collect();
        let mut queue: VecDeque<String> = live_snapshots.iter().cloned().collect();
        while let Some(key) = queue.pop_front() {
            if let Some(Some(parent)) = parents.get(&key) {
                if live_snapshots.insert(parent.clone()) {
                    queue.push_back(parent.clone());
                }
            }
        }

        // Blobs: follow gc refs and variant links
        let blobs = self.content.walk().await?;
        let by_digest: HashMap<&Digest, &Info> = blobs.iter().map(|i| (&i.digest, i)).collect();
        let mut queue: VecDeque<Digest> = live_blobs.iter().cloned().collect();
        while let Some(digest) = queue.pop_front() {
            if let Some(info) = by_digest.get(&digest) {
                for next in referenced_blobs(info) {
                    if live_blobs.insert(next.clone()) {
                        queue.push_back(next);
                    }
                }
            }
        }

        let mut stats = GcStats::default();

        // Children before parents: only remove snapshots nothing else builds on
        let mut remaining: HashMap<String, Option<String>> = parents
            .into_iter()
            .filter(|(k, _)| !live_snapshots.contains(k))
            .collect();
        loop {
            let in_use: HashSet<&String> = remaining.values().flatten().collect();
            let leaves: Vec<String> = remaining
                .keys()
                .filter(|k| !in_use.contains(k))
                .cloned()
                .collect();
            if leaves.is_empty() {
                break;
            }
            for key in leaves {
                remaining.remove(&key);
                match self.snapshotter.remove(&key).await {
                    Ok(()) => {
                        debug!("GC removed snapshot {}", key);
                        stats.snapshots_removed += 1;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("GC could not remove snapshot {}: {}", key, e),
                }
            }
        }

        for info in &blobs {
            if live_blobs.contains(&info.digest) {
                continue;
            }
            match self.content.delete(&info.digest).await {
                Ok(()) => {
                    debug!("GC removed blob {}", info.digest);
                    stats.blobs_removed += 1;
                    stats.bytes_reclaimed += info.size;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("GC could not remove blob {}: {}", info.digest, e),
            }
        }

        if stats.snapshots_removed + stats.blobs_removed > 0 {
            info!(
                "GC removed {} snapshots and {} blobs ({} bytes)",
                stats.snapshots_removed, stats.blobs_removed, stats.bytes_reclaimed
            );
        }
        Ok(stats)
    }
}
