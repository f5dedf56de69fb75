//! Ref lifecycle against the local backends

use crate::common::*;
use snapcache::cache::{DescHandlers, RecordOptions};
use snapcache::compression::Compression;
use snapcache::error::CacheError;
use snapcache::metadata::{CachePolicy, RecordKind};
use snapcache::snapshot::Snapshotter;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Snapshot directories present on disk
fn snapshot_dirs(store: &Store) -> usize {
    let dir = store.config.root.join("snapshots").join("snapshots");
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn commit_and_reopen_lifecycle() {
    let store = store();
    let m = open(&store).await;

    let mref = m.new_ref(None, RecordOptions::described("base")).await.unwrap();
    let mutable_id = mref.id().to_string();
    write_file(&mref, "hello.txt", "hello").await;
    let first = mref.commit().await.unwrap();
    assert_eq!(read_file(&first, "hello.txt").await.as_deref(), Some("hello"));

    // Held immutable locks the mutable
    let err = m.get_mutable(&mutable_id).await.unwrap_err();
    assert!(matches!(err, CacheError::Locked { .. }), "got {err}");
    assert!(err.is_retryable());

    // get on the mutable id resolves to the pending immutable
    let same = m.get(&mutable_id).await.unwrap();
    assert_eq!(same.id(), first.id());
    same.release().await.unwrap();

    first.release().await.unwrap();
    let reopened = m.get_mutable(&mutable_id).await.unwrap();
    write_file(&reopened, "second.txt", "again").await;

    let second = reopened.commit().await.unwrap();
    second.finalize().await.unwrap();
    let second_id = second.id().to_string();
    second.release().await.unwrap();

    assert!(matches!(
        m.get(&mutable_id).await.unwrap_err(),
        CacheError::NotFound(_)
    ));
    assert!(matches!(
        m.get_mutable(&mutable_id).await.unwrap_err(),
        CacheError::NotFound(_)
    ));
    assert!(matches!(
        m.get_mutable(&second_id).await.unwrap_err(),
        CacheError::Invalid { .. }
    ));

    let again = m.get(&second_id).await.unwrap();
    assert_eq!(again.kind(), RecordKind::Committed);
    assert_eq!(read_file(&again, "hello.txt").await.as_deref(), Some("hello"));
    assert_eq!(read_file(&again, "second.txt").await.as_deref(), Some("again"));
    again.release().await.unwrap();
    m.close().await.unwrap();
}

#[tokio::test]
async fn unknown_and_uncommitted_ids() {
    let store = store();
    let m = open(&store).await;

    assert!(matches!(
        m.get("missing").await.unwrap_err(),
        CacheError::NotFound(_)
    ));

    let mref = m.new_ref(None, RecordOptions::default()).await.unwrap();
    let err = m.get(mref.id()).await.unwrap_err();
    assert!(matches!(err, CacheError::Locked { .. }));
    let err = m.get_mutable(mref.id()).await.unwrap_err();
    assert!(matches!(err, CacheError::Locked { .. }));
    mref.release().await.unwrap();
}

#[tokio::test]
async fn released_mutable_is_reclaimed_unless_retained() {
    let store = store();
    let m = open(&store).await;

    let scratch = m.new_ref(None, RecordOptions::default()).await.unwrap();
    let scratch_id = scratch.id().to_string();
    write_file(&scratch, "tmp", "x").await;
    scratch.release().await.unwrap();
    assert!(matches!(
        m.get_mutable(&scratch_id).await.unwrap_err(),
        CacheError::NotFound(_)
    ));

    let opts = RecordOptions {
        cache_policy: CachePolicy::Retain,
        ..RecordOptions::described("cache mount")
    };
    let kept = m.new_ref(None, opts).await.unwrap();
    let kept_id = kept.id().to_string();
    write_file(&kept, "cache/data", "warm").await;
    kept.release().await.unwrap();

    let back = m.get_mutable(&kept_id).await.unwrap();
    let mounts = back.mount(true).await.unwrap();
    let path = snapcache::snapshot::mount_path(&mounts).unwrap().join("cache/data");
    assert_eq!(std::fs::read_to_string(path).unwrap(), "warm");
    back.release().await.unwrap();

    let snapshots = m.snapshotter().walk().await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].key, kept_id);
}

#[tokio::test]
async fn child_refs_see_parent_content() {
    let store = store();
    let m = open(&store).await;

    let base = committed(&m, None, &[("etc/os", "base")]).await;
    let child = committed(&m, Some(&base), &[("app/bin", "app")]).await;

    assert_eq!(read_file(&child, "etc/os").await.as_deref(), Some("base"));
    assert_eq!(read_file(&child, "app/bin").await.as_deref(), Some("app"));
    assert_eq!(read_file(&base, "app/bin").await, None);
    assert_eq!(child.info().parent.as_deref(), Some(base.id()));

    let mounts = child.mount(false).await.unwrap();
    assert!(mounts.iter().all(|mnt| mnt.is_readonly()));

    child.release().await.unwrap();
    base.release().await.unwrap();
}

#[tokio::test]
async fn get_by_blob_dedups_and_shares_chain() {
    let store = store();
    let m = open(&store).await;

    let tar = layer_tar(&[("foo", "bar")]);
    let (raw, raw_blob) = layer_blob(&tar, Compression::Uncompressed);
    let (gz, gz_blob) = layer_blob(&tar, Compression::Gzip);
    let (_provider, handlers) = memory_handlers(&[raw_blob, gz_blob]);

    let a = m.get_by_blob(&raw, None, handlers.clone()).await.unwrap();
    let b = m.get_by_blob(&gz, None, handlers.clone()).await.unwrap();
    let a_again = m.get_by_blob(&raw, None, handlers.clone()).await.unwrap();

    assert_eq!(a.id(), a_again.id());
    assert_ne!(a.id(), b.id());
    assert!(a.is_lazy());
    assert_eq!(a.info().chain_id, b.info().chain_id);
    assert_ne!(a.info().blob_chain_id, b.info().blob_chain_id);
    assert_eq!(a.info().chain_id, Some(snapcache::digest::Digest::from_bytes(&tar)));

    assert_eq!(read_file(&a, "foo").await.as_deref(), Some("bar"));
    assert!(!a.is_lazy());
    // Same chain reuses the extracted snapshot
    assert_eq!(read_file(&b, "foo").await.as_deref(), Some("bar"));
    assert_eq!(a.info().snapshot_id, b.info().snapshot_id);

    for r in [a, b, a_again] {
        r.release().await.unwrap();
    }
}

#[tokio::test]
async fn lazy_blob_needs_a_provider() {
    let store = store();
    let m = open(&store).await;

    let tar = layer_tar(&[("lazy", "content")]);
    let (desc, blob) = layer_blob(&tar, Compression::Gzip);

    let err = m
        .get_by_blob(&desc, None, DescHandlers::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::ContentNotFound(_)), "got {err}");

    let (_provider, handlers) = memory_handlers(&[blob]);
    let lazy = m.get_by_blob(&desc, None, handlers).await.unwrap();
    let bare = m.get(lazy.id()).await.unwrap();
    let err = bare.mount(true).await.unwrap_err();
    assert!(matches!(err, CacheError::LazyContentUnavailable(_)), "got {err}");
    assert!(err.is_retryable());

    lazy.extract(&CancellationToken::new()).await.unwrap();
    assert!(!lazy.is_lazy());
    assert!(m.content().info(&desc.digest).await.is_ok());
    // Extracted content no longer needs the handler
    assert_eq!(read_file(&bare, "lazy").await.as_deref(), Some("content"));

    bare.release().await.unwrap();
    lazy.release().await.unwrap();
}

#[tokio::test]
async fn lazy_layers_stack_on_lazy_parents() {
    let store = store();
    let m = open(&store).await;

    let base_tar = layer_tar(&[("base", "1")]);
    let top_tar = layer_tar(&[("top", "2")]);
    let (base_desc, base_blob) = layer_blob(&base_tar, Compression::Gzip);
    let (top_desc, top_blob) = layer_blob(&top_tar, Compression::Zstd);
    let (_provider, handlers) = memory_handlers(&[base_blob, top_blob]);

    let base = m.get_by_blob(&base_desc, None, handlers.clone()).await.unwrap();
    let top = m
        .get_by_blob(&top_desc, Some(&base), DescHandlers::new())
        .await
        .unwrap();
    assert!(top.descriptor_handlers().contains(&top_desc.digest));

    assert_eq!(read_file(&top, "base").await.as_deref(), Some("1"));
    assert_eq!(read_file(&top, "top").await.as_deref(), Some("2"));
    assert!(!base.is_lazy());

    top.release().await.unwrap();
    base.release().await.unwrap();
}

#[tokio::test]
async fn mismatched_diff_id_is_rejected() {
    let store = store();
    let m = open(&store).await;

    let tar = layer_tar(&[("a", "1")]);
    let other = layer_tar(&[("a", "2")]);
    let (mut desc, blob) = layer_blob(&tar, Compression::Gzip);
    desc = desc.with_uncompressed(&snapcache::digest::Digest::from_bytes(&other));
    let (_provider, handlers) = memory_handlers(&[blob]);

    let r = m.get_by_blob(&desc, None, handlers).await.unwrap();
    let err = r.extract(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CacheError::ContentMismatch { .. }), "got {err}");
    assert!(r.is_lazy());
    r.release().await.unwrap();
}

#[tokio::test]
async fn merge_unions_inputs() {
    let store = store();
    let m = open(&store).await;

    let a = committed(&m, None, &[("a", "1"), ("shared", "from a")]).await;
    let b = committed(&m, None, &[("b", "2")]).await;
    let c = committed(&m, None, &[("c", "3"), ("shared", "from c")]).await;

    let merged = m
        .merge(&[&a, &b, &c], RecordOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.kind(), RecordKind::Merge);
    let merged_id = merged.id().to_string();
    for r in [a, b, c] {
        r.release().await.unwrap();
    }

    assert_eq!(read_file(&merged, "a").await.as_deref(), Some("1"));
    assert_eq!(read_file(&merged, "b").await.as_deref(), Some("2"));
    assert_eq!(read_file(&merged, "c").await.as_deref(), Some("3"));
    assert_eq!(read_file(&merged, "shared").await.as_deref(), Some("from c"));

    let again = m.get(&merged_id).await.unwrap();
    assert_eq!(again.info().merge_parents.len(), 3);
    again.release().await.unwrap();
    merged.release().await.unwrap();
}

#[tokio::test]
async fn merge_flattens_and_dedups() {
    let store = store();
    let m = open(&store).await;

    let a = committed(&m, None, &[("a", "1")]).await;
    let b = committed(&m, None, &[("b", "2")]).await;
    let c = committed(&m, None, &[("c", "3")]).await;

    assert!(m.merge(&[], RecordOptions::default()).await.unwrap().is_none());

    let single = m
        .merge(&[&a, &a], RecordOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(single.id(), a.id());

    let ab = m
        .merge(&[&a, &b], RecordOptions::default())
        .await
        .unwrap()
        .unwrap();
    let abc = m
        .merge(&[&ab, &c, &b], RecordOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        abc.info().merge_parents,
        vec![a.id().to_string(), b.id().to_string(), c.id().to_string()]
    );

    for r in [single, ab, abc, a, b, c] {
        r.release().await.unwrap();
    }
}

#[tokio::test]
async fn merge_of_blob_layers_matches_linear_chain() {
    let store = store();
    let m = open(&store).await;

    let (lower, lower_blob) = layer_blob(&layer_tar(&[("x", "1")]), Compression::Gzip);
    let (upper, upper_blob) = layer_blob(&layer_tar(&[("y", "2")]), Compression::Gzip);
    let (_provider, handlers) = memory_handlers(&[lower_blob, upper_blob]);

    let a = m.get_by_blob(&lower, None, handlers.clone()).await.unwrap();
    let b = m.get_by_blob(&upper, None, handlers.clone()).await.unwrap();
    let merged = m
        .merge(&[&a, &b], RecordOptions::default())
        .await
        .unwrap()
        .unwrap();

    let merged_chain = merged.info().blob_chain_id.unwrap();
    assert_ne!(Some(&merged_chain), a.info().blob_chain_id.as_ref());
    assert_ne!(Some(&merged_chain), b.info().blob_chain_id.as_ref());

    let linear = m.get_by_blob(&upper, Some(&a), handlers).await.unwrap();
    assert_eq!(linear.id(), merged.id());

    for r in [linear, merged, a, b] {
        r.release().await.unwrap();
    }
}

#[tokio::test]
async fn diff_captures_changes() {
    let store = store();
    let m = open(&store).await;

    let base = committed(&m, None, &[("keep", "k"), ("gone", "g")]).await;
    let upper = {
        let mref = m.new_ref(Some(&base), RecordOptions::default()).await.unwrap();
        write_file(&mref, "added", "a").await;
        remove_file(&mref, "gone").await;
        let imm = mref.commit().await.unwrap();
        imm.finalize().await.unwrap();
        imm
    };

    assert!(m
        .diff(Some(&base), Some(&base), RecordOptions::default())
        .await
        .unwrap()
        .is_none());
    assert!(m
        .diff(None, None, RecordOptions::default())
        .await
        .unwrap()
        .is_none());
    let whole = m
        .diff(None, Some(&upper), RecordOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(whole.id(), upper.id());

    let delta = m
        .diff(Some(&base), Some(&upper), RecordOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delta.kind(), RecordKind::Diff);
    assert_eq!(read_file(&delta, "added").await.as_deref(), Some("a"));
    assert_eq!(read_file(&delta, "keep").await, None);

    // Applying the diff onto the base reproduces the upper tree
    let rebuilt = m
        .merge(&[&base, &delta], RecordOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read_file(&rebuilt, "keep").await.as_deref(), Some("k"));
    assert_eq!(read_file(&rebuilt, "added").await.as_deref(), Some("a"));
    assert_eq!(read_file(&rebuilt, "gone").await, None);

    for r in [rebuilt, delta, whole, upper, base] {
        r.release().await.unwrap();
    }
}

#[tokio::test]
async fn mount_pool_tracks_live_mounts() {
    let store = store();
    let m = open(&store).await;

    let a = committed(&m, None, &[("a", "1")]).await;
    let b = committed(&m, None, &[("b", "2")]).await;

    let first = a.mount_pooled().await.unwrap();
    let shared = a.mount_pooled().await.unwrap();
    let other = b.mount_pooled().await.unwrap();
    assert!(first.is_readonly());
    assert_eq!(first.path(), shared.path());
    assert_eq!(m.mount_pool().active(), 2);
    assert!(first.path().join("a").exists());

    drop(first);
    assert_eq!(m.mount_pool().active(), 2);
    drop(shared);
    drop(other);
    assert_eq!(m.mount_pool().active(), 0);

    a.release().await.unwrap();
    b.release().await.unwrap();
    m.close().await.unwrap();
    assert!(m.get("anything").await.is_err());
}

#[tokio::test]
async fn records_survive_restart() {
    let store = store();
    let (kept_id, pending_id, mutable_id) = {
        let m = open(&store).await;
        let kept = committed(&m, None, &[("kept", "yes")]).await;
        let kept_id = kept.id().to_string();
        kept.release().await.unwrap();

        let mref = m.new_ref(None, RecordOptions::default()).await.unwrap();
        let mutable_id = mref.id().to_string();
        write_file(&mref, "pending", "yes").await;
        let pending = mref.commit().await.unwrap();
        let pending_id = pending.id().to_string();
        pending.release().await.unwrap();

        m.close().await.unwrap();
        (kept_id, pending_id, mutable_id)
    };

    let m = open(&store).await;
    let kept = m.get(&kept_id).await.unwrap();
    assert_eq!(read_file(&kept, "kept").await.as_deref(), Some("yes"));

    let pending = m.get(&pending_id).await.unwrap();
    assert_eq!(pending.info().equal_mutable.as_deref(), Some(mutable_id.as_str()));
    assert_eq!(read_file(&pending, "pending").await.as_deref(), Some("yes"));
    pending.finalize().await.unwrap();
    assert!(m.get_mutable(&mutable_id).await.is_err());
    assert_eq!(read_file(&pending, "pending").await.as_deref(), Some("yes"));

    kept.release().await.unwrap();
    pending.release().await.unwrap();
}

#[tokio::test]
async fn cancelled_extract_leaves_no_stray_snapshots() {
    let store = store();
    let m = open(&store).await;

    let files: Vec<(String, String)> = (0..300)
        .map(|i| (format!("dir{}/file{}", i % 10, i), "x".repeat(2048)))
        .collect();
    let entries: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    let tar = layer_tar(&entries);
    let (desc, blob) = layer_blob(&tar, Compression::Gzip);
    let (_provider, handlers) = memory_handlers(&[blob]);
    let r = m.get_by_blob(&desc, None, handlers).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = r.extract(&cancel).await.unwrap_err();
    assert!(matches!(err, CacheError::Cancelled), "got {err}");
    assert!(r.is_lazy());
    assert_eq!(snapshot_dirs(&store), m.snapshotter().walk().await.unwrap().len());

    // Cancelling while the layer is being applied
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        trigger.cancel();
    });
    let outcome = r.extract(&cancel).await;
    assert!(
        matches!(outcome, Ok(()) | Err(CacheError::Cancelled)),
        "got {outcome:?}"
    );
    assert_eq!(outcome.is_err(), r.is_lazy());
    assert_eq!(snapshot_dirs(&store), m.snapshotter().walk().await.unwrap().len());

    r.extract(&CancellationToken::new()).await.unwrap();
    assert!(!r.is_lazy());
    assert_eq!(
        read_file(&r, "dir3/file3").await.as_deref(),
        Some("x".repeat(2048).as_str())
    );
    assert_eq!(snapshot_dirs(&store), m.snapshotter().walk().await.unwrap().len());
    r.release().await.unwrap();
}

#[tokio::test]
async fn restart_completes_half_finished_finalize() {
    let store = store();
    let (imm_id, mutable_id) = {
        let m = open(&store).await;
        let mref = m.new_ref(None, RecordOptions::default()).await.unwrap();
        let mutable_id = mref.id().to_string();
        let mutable_key = mref.info().snapshot_id;
        write_file(&mref, "pending", "yes").await;
        let imm = mref.commit().await.unwrap();
        let imm_id = imm.id().to_string();
        let imm_key = imm.info().snapshot_id;
        imm.release().await.unwrap();

        // The snapshot commit landed but the metadata update did not
        m.snapshotter().commit(&imm_key, &mutable_key).await.unwrap();
        m.close().await.unwrap();
        (imm_id, mutable_id)
    };

    let m = open(&store).await;
    let imm = m.get(&imm_id).await.unwrap();
    assert_eq!(imm.info().equal_mutable, None);
    assert_eq!(read_file(&imm, "pending").await.as_deref(), Some("yes"));
    assert!(matches!(
        m.get_mutable(&mutable_id).await.unwrap_err(),
        CacheError::NotFound(_)
    ));
    imm.release().await.unwrap();

    // Finished records survive another restart unchanged
    m.close().await.unwrap();
    let m = open(&store).await;
    let imm = m.get(&imm_id).await.unwrap();
    assert_eq!(read_file(&imm, "pending").await.as_deref(), Some("yes"));
    imm.release().await.unwrap();
}

#[tokio::test]
async fn restart_rolls_back_commit_without_snapshot() {
    let store = store();
    let (imm_id, mutable_id) = {
        let m = open(&store).await;
        let mref = m.new_ref(None, RecordOptions::default()).await.unwrap();
        let mutable_id = mref.id().to_string();
        let mutable_key = mref.info().snapshot_id;
        write_file(&mref, "lost", "yes").await;
        let imm = mref.commit().await.unwrap();
        let imm_id = imm.id().to_string();
        imm.release().await.unwrap();

        m.snapshotter().remove(&mutable_key).await.unwrap();
        m.close().await.unwrap();
        (imm_id, mutable_id)
    };

    let m = open(&store).await;
    assert!(matches!(
        m.get(&imm_id).await.unwrap_err(),
        CacheError::NotFound(_)
    ));
    assert!(matches!(
        m.get_mutable(&mutable_id).await.unwrap_err(),
        CacheError::NotFound(_)
    ));
}
