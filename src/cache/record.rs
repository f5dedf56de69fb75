//! In-memory cache records
//!
//! A record wraps the persisted metadata of one ref with the runtime state
//! that never hits disk: the handle count, the resolved parent records and
//! the per-record operation lock. Child records own their parents through
//! `Arc`, so a parent's record outlives every child built on it.

use crate::digest::Digest;
use crate::metadata::{RecordKind, RecordMetadata};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Length of generated record ids
const ID_LEN: usize = 26;

/// Generate a fresh record id
pub(crate) fn new_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}

/// Resolved ancestry of a record
pub(crate) enum Parents {
    None,
    Layer(Arc<CacheRecord>),
    Merge(Vec<Arc<CacheRecord>>),
    Diff {
        lower: Option<Arc<CacheRecord>>,
        upper: Option<Arc<CacheRecord>>,
    },
}

impl Parents {
    /// Every parent record, in declaration order
    pub(crate) fn records(&self) -> Vec<&Arc<CacheRecord>> {
        match self {
            Self::None => vec![],
            Self::Layer(p) => vec![p],
            Self::Merge(ps) => ps.iter().collect(),
            Self::Diff { lower, upper } => lower.iter().chain(upper.iter()).collect(),
        }
    }
}

pub(crate) struct CacheRecord {
    pub(crate) id: String,
    pub(crate) parents: Parents,
    md: RwLock<RecordMetadata>,
    refs: AtomicUsize,
    dead: AtomicBool,
    /// Serializes blob attachment, chain computation and extraction
    pub(crate) op: tokio::sync::Mutex<()>,
}

impl CacheRecord {
    pub(crate) fn new(md: RecordMetadata, parents: Parents) -> Arc<Self> {
        Arc::new(Self {
            id: md.id.clone(),
            parents,
            md: RwLock::new(md),
            refs: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
            op: tokio::sync::Mutex::new(()),
        })
    }

    pub(crate) fn md(&self) -> RecordMetadata {
        self.md.read().clone()
    }

    pub(crate) fn with_md<R>(&self, f: impl FnOnce(&RecordMetadata) -> R) -> R {
        f(&self.md.read())
    }

    /// Apply `f` and return the updated metadata for persisting
    pub(crate) fn update_md(&self, f: impl FnOnce(&mut RecordMetadata)) -> RecordMetadata {
        let mut md = self.md.write();
        f(&mut md);
        md.clone()
    }

    pub(crate) fn kind(&self) -> RecordKind {
        self.with_md(|md| md.kind)
    }

    pub(crate) fn is_mutable(&self) -> bool {
        self.kind() == RecordKind::Active
    }

    pub(crate) fn snapshot_id(&self) -> String {
        self.with_md(|md| md.snapshot_id.clone())
    }

    pub(crate) fn blob_only(&self) -> bool {
        self.with_md(|md| md.blob_only)
    }

    pub(crate) fn equal_mutable(&self) -> Option<String> {
        self.with_md(|md| md.equal_mutable.clone())
    }

    pub(crate) fn equal_immutable(&self) -> Option<String> {
        self.with_md(|md| md.equal_immutable.clone())
    }

    pub(crate) fn blob_chain_id(&self) -> Option<Digest> {
        self.with_md(|md| md.blob_chain_id.clone())
    }

    pub(crate) fn chain_id(&self) -> Option<Digest> {
        self.with_md(|md| md.chain_id.clone())
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one handle, returning how many remain
    pub(crate) fn release_one(&self) -> usize {
        let prev = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub(crate) fn depends_on(&self, id: &str) -> bool {
        self.parents.records().iter().any(|p| p.id == id)
    }

    /// Records whose blobs make up this record's layers, base first
    ///
    /// A merge contributes its parents' layers in order; a diff is a single
    /// layer of its own.
    pub(crate) fn layer_chain(self: &Arc<Self>) -> Vec<Arc<CacheRecord>> {
        match &self.parents {
            Parents::None | Parents::Diff { .. } => vec![Arc::clone(self)],
            Parents::Layer(p) => {
                let mut chain = p.layer_chain();
                chain.push(Arc::clone(self));
                chain
            }
            Parents::Merge(ps) => ps.iter().flat_map(|p| p.layer_chain()).collect(),
        }
    }
}

/// Every live record, keyed by id
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) records: HashMap<String, Arc<CacheRecord>>,
}

impl Registry {
    pub(crate) fn get(&self, id: &str) -> Option<Arc<CacheRecord>> {
        self.records.get(id).filter(|r| !r.is_dead()).cloned()
    }

    pub(crate) fn insert(&mut self, rec: Arc<CacheRecord>) {
        self.records.insert(rec.id.clone(), rec);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Arc<CacheRecord>> {
        let rec = self.records.remove(id)?;
        rec.mark_dead();
        Some(rec)
    }

    /// Records built directly on `id`
    pub(crate) fn dependents(&self, id: &str) -> Vec<Arc<CacheRecord>> {
        self.records
            .values()
            .filter(|r| !r.is_dead() && r.depends_on(id))
            .cloned()
            .collect()
    }

    /// Whether a record has live handles or anything built on it
    pub(crate) fn is_held(&self, rec: &CacheRecord) -> bool {
        rec.refs() > 0 || !self.dependents(&rec.id).is_empty()
    }

    /// Oldest record with the given blob chain
    pub(crate) fn find_by_blob_chain(&self, blob_chain_id: &Digest) -> Option<Arc<CacheRecord>> {
        self.records
            .values()
            .filter(|r| !r.is_dead() && r.blob_chain_id().as_ref() == Some(blob_chain_id))
            .min_by_key(|r| r.with_md(|md| (md.created_at, md.id.clone())))
            .cloned()
    }

    /// A committed, extracted record with the given chain
    pub(crate) fn find_extracted_chain(&self, chain_id: &Digest) -> Option<Arc<CacheRecord>> {
        self.records
            .values()
            .filter(|r| {
                !r.is_dead()
                    && r.with_md(|md| {
                        md.kind == RecordKind::Committed
                            && !md.blob_only
                            && md.equal_mutable.is_none()
                            && md.chain_id.as_ref() == Some(chain_id)
                    })
            })
            .min_by_key(|r| r.with_md(|md| (md.created_at, md.id.clone())))
            .cloned()
    }
}
