//! Disk usage reporting and pruning

use crate::common::*;
use snapcache::cache::{Manager, PruneInfo, RecordOptions, UsageInfo};
use snapcache::metadata::RecordType;
use snapcache::snapshot::Snapshotter;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

async fn prune(m: &Manager, opts: PruneInfo) -> Vec<UsageInfo> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    m.prune(Some(&tx), opts).await.unwrap();
    drop(tx);
    let mut out = vec![];
    while let Some(usage) = rx.recv().await {
        out.push(usage);
    }
    out
}

fn ids(records: &[UsageInfo]) -> HashSet<String> {
    records.iter().map(|r| r.id.clone()).collect()
}

#[tokio::test]
async fn disk_usage_reports_records() {
    let store = store();
    let m = open(&store).await;

    let held = committed(&m, None, &[("held", "0123456789")]).await;
    let idle = committed(&m, None, &[("idle", "x")]).await;
    let idle_id = idle.id().to_string();
    idle.release().await.unwrap();

    let pending = {
        let mref = m.new_ref(None, RecordOptions::described("pending")).await.unwrap();
        write_file(&mref, "p", "p").await;
        mref.commit().await.unwrap()
    };

    let usage = m.disk_usage(&[]).await.unwrap();
    assert_eq!(usage.len(), 3);
    let held_info = usage.iter().find(|u| u.id == held.id()).unwrap();
    assert!(held_info.in_use);
    assert!(!held_info.mutable);
    assert!(held_info.size >= 10);
    assert_eq!(held_info.description, "test layer");

    let idle_info = usage.iter().find(|u| u.id == idle_id).unwrap();
    assert!(!idle_info.in_use);
    assert_eq!(idle_info.usage_count, 1);
    assert!(idle_info.last_used_at.is_some());

    // A pending pair is listed once, under the immutable
    assert!(usage.iter().any(|u| u.id == pending.id() && u.in_use));

    let filtered = m
        .disk_usage(&[format!("id=={}", idle_id)])
        .await
        .unwrap();
    assert_eq!(ids(&filtered), HashSet::from([idle_id]));
    assert!(m.disk_usage(&["bogus".to_string()]).await.is_err());

    held.release().await.unwrap();
    pending.release().await.unwrap();
}

#[tokio::test]
async fn in_use_counts_match_held_refs() {
    let store = store();
    let m = open(&store).await;

    let base = committed(&m, None, &[("base", "1")]).await;
    let child = committed(&m, Some(&base), &[("child", "2")]).await;
    let lone = committed(&m, None, &[("lone", "3")]).await;
    base.release().await.unwrap();
    lone.release().await.unwrap();

    let usage = m.disk_usage(&[]).await.unwrap();
    let in_use = ids(&usage.iter().filter(|u| u.in_use).cloned().collect::<Vec<_>>());
    // The base is in use through its held child
    assert_eq!(
        in_use,
        HashSet::from([child.id().to_string(), child.info().parent.unwrap()])
    );
    assert_eq!(usage.iter().filter(|u| !u.in_use).count(), 1);
    child.release().await.unwrap();
}

#[tokio::test]
async fn prune_reports_each_record_once() {
    let store = store();
    let m = open(&store).await;

    let base = committed(&m, None, &[("base", "1")]).await;
    let child = committed(&m, Some(&base), &[("child", "2")]).await;
    let lone = committed(&m, None, &[("lone", "3")]).await;
    let held = committed(&m, None, &[("held", "4")]).await;
    let expected = HashSet::from([
        base.id().to_string(),
        child.id().to_string(),
        lone.id().to_string(),
    ]);
    for r in [base, child, lone] {
        r.release().await.unwrap();
    }

    let removed = prune(&m, PruneInfo::default()).await;
    assert_eq!(removed.len(), 3);
    assert_eq!(ids(&removed), expected);
    assert!(prune(&m, PruneInfo::default()).await.is_empty());

    let remaining = m.disk_usage(&[]).await.unwrap();
    assert_eq!(ids(&remaining), HashSet::from([held.id().to_string()]));
    assert_eq!(read_file(&held, "held").await.as_deref(), Some("4"));

    held.release().await.unwrap();
    prune(&m, PruneInfo::default()).await;
    assert!(m.snapshotter().walk().await.unwrap().is_empty());
    assert!(m.content().walk().await.unwrap().is_empty());
}

#[tokio::test]
async fn merge_keeps_inputs_until_released() {
    let store = store();
    let m = open(&store).await;

    let a = committed(&m, None, &[("a", "1")]).await;
    let b = committed(&m, None, &[("b", "2")]).await;
    let c = committed(&m, None, &[("c", "3")]).await;
    let merged = m
        .merge(&[&a, &b, &c], RecordOptions::default())
        .await
        .unwrap()
        .unwrap();
    let inputs = HashSet::from([a.id().to_string(), b.id().to_string(), c.id().to_string()]);
    for r in [a, b, c] {
        r.release().await.unwrap();
    }

    assert!(prune(&m, PruneInfo::default()).await.is_empty());
    assert_eq!(read_file(&merged, "a").await.as_deref(), Some("1"));
    assert_eq!(read_file(&merged, "c").await.as_deref(), Some("3"));
    assert!(prune(&m, PruneInfo::default()).await.is_empty());

    let merged_id = merged.id().to_string();
    merged.release().await.unwrap();
    let removed = prune(&m, PruneInfo::default()).await;
    let mut expected = inputs;
    expected.insert(merged_id);
    assert_eq!(ids(&removed), expected);
    assert!(m.snapshotter().walk().await.unwrap().is_empty());
}

#[tokio::test]
async fn prune_respects_filters_and_types() {
    let store = store();
    let m = open(&store).await;

    let regular = committed(&m, None, &[("r", "1")]).await;
    let internal = {
        let opts = RecordOptions {
            record_type: RecordType::Internal,
            ..RecordOptions::default()
        };
        let mref = m.new_ref(None, opts).await.unwrap();
        let imm = mref.commit().await.unwrap();
        imm.finalize().await.unwrap();
        imm
    };
    let other = committed(&m, None, &[("o", "2")]).await;
    let (regular_id, internal_id, other_id) = (
        regular.id().to_string(),
        internal.id().to_string(),
        other.id().to_string(),
    );
    for r in [regular, internal, other] {
        r.release().await.unwrap();
    }

    let only = PruneInfo {
        filters: vec![format!("id=={}", regular_id)],
        ..PruneInfo::default()
    };
    assert_eq!(ids(&prune(&m, only).await), HashSet::from([regular_id]));

    let dry = PruneInfo {
        dry_run: true,
        all: true,
        ..PruneInfo::default()
    };
    assert_eq!(prune(&m, dry).await.len(), 2);
    assert_eq!(m.disk_usage(&[]).await.unwrap().len(), 2);

    let removed = prune(&m, PruneInfo::default()).await;
    assert_eq!(ids(&removed), HashSet::from([other_id]));

    let typed = PruneInfo {
        all: true,
        filters: vec!["type==internal".to_string()],
        ..PruneInfo::default()
    };
    assert_eq!(ids(&prune(&m, typed).await), HashSet::from([internal_id]));
}

#[tokio::test]
async fn prune_keeps_recent_and_budgeted_records() {
    let store = store();
    let m = open(&store).await;

    let first = committed(&m, None, &[("first", "1111")]).await;
    let second = committed(&m, None, &[("second", "2222")]).await;
    let first_id = first.id().to_string();
    first.release().await.unwrap();
    second.release().await.unwrap();

    let recent = PruneInfo {
        keep_duration: Some(Duration::from_secs(3600)),
        ..PruneInfo::default()
    };
    assert!(prune(&m, recent).await.is_empty());

    // Oldest unused records go first until the rest fits the budget
    let usage = m.disk_usage(&[]).await.unwrap();
    let largest = usage.iter().map(|u| u.size).max().unwrap();
    let budget = PruneInfo {
        keep_bytes: largest,
        ..PruneInfo::default()
    };
    let removed = prune(&m, budget).await;
    assert_eq!(ids(&removed), HashSet::from([first_id]));
    assert_eq!(m.disk_usage(&[]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn pruned_records_stay_gone_after_restart() {
    let store = store();
    let kept_id = {
        let m = open(&store).await;
        let gone = committed(&m, None, &[("gone", "1")]).await;
        let kept = committed(&m, None, &[("kept", "2")]).await;
        gone.release().await.unwrap();
        assert_eq!(prune(&m, PruneInfo::default()).await.len(), 1);
        let id = kept.id().to_string();
        kept.release().await.unwrap();
        m.close().await.unwrap();
        id
    };

    let m = open(&store).await;
    let usage = m.disk_usage(&[]).await.unwrap();
    assert_eq!(ids(&usage), HashSet::from([kept_id]));
}
