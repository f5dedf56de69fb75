//! Disk usage and pruning

use super::manager::{Inner, Manager};
use super::options::{PruneInfo, UsageInfo};
use super::record::{CacheRecord, Registry};
use crate::error::{CacheError, CacheResult};
use crate::metadata::{RecordKind, RecordType};
use crate::snapshot::Snapshotter;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// A single `KEY==VALUE` / `KEY~=PREFIX` record filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Filter {
    IdEquals(String),
    IdPrefix(String),
    Type(RecordType),
}

impl Filter {
    pub(crate) fn parse(expr: &str) -> CacheResult<Self> {
        let (key, op, value) = if let Some((k, v)) = expr.split_once("==") {
            (k.trim(), "==", v.trim())
        } else if let Some((k, v)) = expr.split_once("~=") {
            (k.trim(), "~=", v.trim())
        } else {
            return Err(CacheError::invalid(
                expr,
                "filter must look like KEY==VALUE or KEY~=PREFIX",
            ));
        };
        match (key, op) {
            ("id", "==") => Ok(Self::IdEquals(value.to_string())),
            ("id", "~=") => Ok(Self::IdPrefix(value.to_string())),
            ("type", "==") => Ok(Self::Type(value.parse()?)),
            _ => Err(CacheError::invalid(
                expr,
                "unsupported filter (expected id==, id~= or type==)",
            )),
        }
    }

    fn matches(&self, unit: &Unit) -> bool {
        match self {
            Self::IdEquals(id) => unit.members.iter().any(|m| &m.id == id),
            Self::IdPrefix(prefix) => unit.members.iter().any(|m| m.id.starts_with(prefix.as_str())),
            Self::Type(t) => unit.head.with_md(|md| md.record_type == *t),
        }
    }
}

fn parse_filters(filters: &[String]) -> CacheResult<Vec<Filter>> {
    filters.iter().map(|f| Filter::parse(f)).collect()
}

/// Records reported and reclaimed together
///
/// A committed record awaiting finalize travels with the mutable that still
/// owns its snapshot.
struct Unit {
    head: Arc<CacheRecord>,
    members: Vec<Arc<CacheRecord>>,
}

impl Unit {
    fn last_used(&self) -> DateTime<Utc> {
        self.head
            .with_md(|md| md.last_used_at.unwrap_or(md.created_at))
    }
}

fn units(reg: &Registry, removed: &HashSet<String>) -> Vec<Unit> {
    let live = |id: &str| reg.get(id).filter(|r| !removed.contains(&r.id));
    let mut out = vec![];
    for rec in reg.records.values() {
        if rec.is_dead() || removed.contains(&rec.id) {
            continue;
        }
        if rec.is_mutable() {
            if rec.equal_immutable().and_then(|imm| live(&imm)).is_some() {
                continue;
            }
            out.push(Unit {
                head: rec.clone(),
                members: vec![rec.clone()],
            });
            continue;
        }
        let mut members = vec![rec.clone()];
        if let Some(mutable) = rec.equal_mutable().and_then(|mid| live(&mid)) {
            members.push(mutable);
        }
        out.push(Unit {
            head: rec.clone(),
            members,
        });
    }
    out.sort_by(|a, b| {
        a.last_used()
            .cmp(&b.last_used())
            .then_with(|| a.head.id.cmp(&b.head.id))
    });
    out
}

fn in_use(
    reg: &Registry,
    rec: &CacheRecord,
    removed: &HashSet<String>,
    visited: &mut HashSet<String>,
) -> bool {
    if !visited.insert(rec.id.clone()) {
        return false;
    }
    if rec.refs() > 0 {
        return true;
    }
    reg.dependents(&rec.id)
        .iter()
        .filter(|d| !removed.contains(&d.id))
        .any(|d| in_use(reg, d, removed, visited))
}

fn unit_in_use(reg: &Registry, unit: &Unit, removed: &HashSet<String>) -> bool {
    let mut visited = HashSet::new();
    unit.members
        .iter()
        .any(|m| in_use(reg, m, removed, &mut visited))
}

fn has_dependents(reg: &Registry, unit: &Unit, removed: &HashSet<String>) -> bool {
    unit.members.iter().any(|m| {
        reg.dependents(&m.id)
            .iter()
            .any(|d| !removed.contains(&d.id) && !unit.members.iter().any(|u| u.id == d.id))
    })
}

/// How many live records use each snapshot key
fn snapshot_users(reg: &Registry, removed: &HashSet<String>) -> HashMap<String, usize> {
    let mut users = HashMap::new();
    for rec in reg.records.values() {
        if rec.is_dead() || removed.contains(&rec.id) || rec.blob_only() {
            continue;
        }
        *users.entry(rec.snapshot_id()).or_insert(0) += 1;
    }
    users
}

impl Inner {
    /// Disk used by a record's snapshot, or by its blob while lazy
    async fn record_size(&self, rec: &CacheRecord) -> CacheResult<u64> {
        let md = rec.md();
        if let Some(size) = md.size {
            return Ok(size);
        }
        let key = md.equal_mutable.clone().unwrap_or_else(|| md.snapshot_id.clone());
        match self.snapshotter.usage(&key).await {
            Ok(usage) => {
                let settled = md.kind != RecordKind::Active && md.equal_mutable.is_none();
                if settled {
                    let md = rec.update_md(|md| md.size = Some(usage.size));
                    self.persist(&md).await?;
                }
                Ok(usage.size)
            }
            Err(e) if e.is_not_found() => Ok(md.blob.map(|b| b.size).unwrap_or(0)),
            Err(e) => Err(e),
        }
    }

    async fn usage_info(
        &self,
        reg: &Registry,
        unit: &Unit,
        removed: &HashSet<String>,
        users: &HashMap<String, usize>,
    ) -> CacheResult<UsageInfo> {
        let size = self.record_size(&unit.head).await?;
        let md = unit.head.md();
        let shared = !md.blob_only && users.get(&md.snapshot_id).copied().unwrap_or(0) > 1;
        Ok(UsageInfo {
            id: md.id.clone(),
            mutable: md.kind == RecordKind::Active,
            in_use: unit_in_use(reg, unit, removed),
            size,
            created_at: md.created_at,
            last_used_at: md.last_used_at,
            usage_count: md.usage_count,
            parents: md.dependencies(),
            description: md.description,
            record_type: md.record_type,
            shared,
        })
    }

    /// Tombstone, unregister and forget every record of a unit
    async fn delete_unit(&self, reg: &mut Registry, unit: &Unit) -> CacheResult<()> {
        for m in &unit.members {
            let md = m.update_md(|md| md.deleted = true);
            self.persist(&md).await?;
        }
        for m in &unit.members {
            reg.remove(&m.id);
        }
        for m in &unit.members {
            self.forget(&m.id).await?;
        }
        Ok(())
    }
}

impl Manager {
    /// One entry per record matching every filter
    pub async fn disk_usage(&self, filters: &[String]) -> CacheResult<Vec<UsageInfo>> {
        let filters = parse_filters(filters)?;
        let reg = self.inner.registry.lock().await;
        let removed = HashSet::new();
        let users = snapshot_users(&reg, &removed);
        let mut out = vec![];
        for unit in units(&reg, &removed) {
            if filters.iter().all(|f| f.matches(&unit)) {
                out.push(self.inner.usage_info(&reg, &unit, &removed, &users).await?);
            }
        }
        Ok(out)
    }

    /// Reclaim unused records, children before parents
    ///
    /// Every reclaimed record is reported once on `tx`. Rounds repeat until
    /// nothing else becomes eligible; the gc hook then runs once.
    pub async fn prune(
        &self,
        tx: Option<&UnboundedSender<UsageInfo>>,
        opts: PruneInfo,
    ) -> CacheResult<()> {
        self.inner.check_open()?;
        let filters = parse_filters(&opts.filters)?;
        let cutoff = match opts.keep_duration {
            Some(d) => {
                let d = chrono::Duration::from_std(d)
                    .map_err(|_| CacheError::invalid("keep_duration", "duration out of range"))?;
                Some(Utc::now() - d)
            }
            None => None,
        };

        let mut removed: HashSet<String> = HashSet::new();
        let mut reclaimed = 0usize;
        loop {
            let mut reg = self.inner.registry.lock().await;
            let users = snapshot_users(&reg, &removed);
            let unused: Vec<Unit> = units(&reg, &removed)
                .into_iter()
                .filter(|u| !unit_in_use(&reg, u, &removed))
                .collect();

            let mut unused_bytes = 0u64;
            if opts.keep_bytes > 0 {
                for unit in &unused {
                    unused_bytes += self.inner.record_size(&unit.head).await?;
                }
                if unused_bytes <= opts.keep_bytes {
                    break;
                }
            }

            let candidates: Vec<&Unit> = unused
                .iter()
                .filter(|u| !has_dependents(&reg, u, &removed))
                .filter(|u| opts.all || u.head.with_md(|md| md.record_type != RecordType::Internal))
                .filter(|u| cutoff.map_or(true, |c| u.last_used() < c))
                .filter(|u| filters.iter().all(|f| f.matches(u)))
                .collect();
            if candidates.is_empty() {
                break;
            }

            let mut within_budget = false;
            for unit in candidates {
                if opts.keep_bytes > 0 && unused_bytes <= opts.keep_bytes {
                    within_budget = true;
                    break;
                }
                let usage = self
                    .inner
                    .usage_info(&reg, unit, &removed, &users)
                    .await?;
                unused_bytes = unused_bytes.saturating_sub(usage.size);
                if !opts.dry_run {
                    self.inner.delete_unit(&mut reg, unit).await?;
                }
                removed.extend(unit.members.iter().map(|m| m.id.clone()));
                info!(
                    "{} ref {} ({} bytes)",
                    if opts.dry_run { "Would prune" } else { "Pruned" },
                    usage.id,
                    usage.size
                );
                if let Some(tx) = tx {
                    if tx.send(usage).is_err() {
                        debug!("Prune receiver dropped");
                    }
                }
                reclaimed += 1;
            }
            if within_budget {
                break;
            }
        }

        if reclaimed > 0 && !opts.dry_run {
            if let Some(gc) = &self.inner.gc {
                let _gc = self.inner.gc_lock.write().await;
                let stats = gc.collect().await?;
                info!(
                    "Garbage collection removed {} snapshots and {} blobs ({} bytes)",
                    stats.snapshots_removed, stats.blobs_removed, stats.bytes_reclaimed
                );
            }
        }
        Ok(())
    }
}
