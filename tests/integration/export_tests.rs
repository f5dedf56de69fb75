//! Exporting refs as layer blobs

use crate::common::*;
use snapcache::cache::{RecordOptions, RefConfig};
use snapcache::compression::{media_types, Compression};
use snapcache::content::Provider;
use snapcache::descriptor::Descriptor;
use snapcache::digest::Digest;
use snapcache::error::CacheError;
use snapcache::snapshot::mount_path;
use tokio_util::sync::CancellationToken;

fn config(compression: Compression, force: bool) -> RefConfig {
    RefConfig {
        compression,
        force,
        ..RefConfig::default()
    }
}

#[tokio::test]
async fn remotes_require_blobs_unless_created() {
    let store = store();
    let m = open(&store).await;
    let cancel = CancellationToken::new();

    let r = committed(&m, None, &[("file", "data")]).await;
    let err = r
        .get_remotes(false, &config(Compression::Gzip, false), false, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "got {err}");

    let remotes = r
        .get_remotes(true, &config(Compression::Gzip, false), false, &cancel)
        .await
        .unwrap();
    assert_eq!(remotes.len(), 1);
    let desc = &remotes[0].descriptors[0];
    assert_eq!(desc.media_type, media_types::OCI_LAYER_GZIP);
    assert_eq!(r.info().blob.as_ref(), Some(desc));
    assert!(r.info().chain_id.is_some());

    // The provider serves the computed blob
    let reader = remotes[0].provider.reader_at(desc).await.unwrap();
    let tar = Compression::Gzip.decode(reader.as_bytes()).unwrap();
    assert_eq!(Digest::from_bytes(&tar), desc.diff_id().unwrap());

    // A second export reuses the blob
    let again = r
        .get_remotes(true, &config(Compression::Gzip, false), false, &cancel)
        .await
        .unwrap();
    assert_eq!(again[0].descriptors, remotes[0].descriptors);
    r.release().await.unwrap();
}

#[tokio::test]
async fn layered_ref_exports_base_first() {
    let store = store();
    let m = open(&store).await;
    let cancel = CancellationToken::new();

    let base = committed(&m, None, &[("base", "1")]).await;
    let child = committed(&m, Some(&base), &[("child", "2")]).await;

    let remotes = child
        .get_remotes(true, &config(Compression::Zstd, false), false, &cancel)
        .await
        .unwrap();
    let descs = &remotes[0].descriptors;
    assert_eq!(descs.len(), 2);
    assert_eq!(Some(&descs[0]), base.info().blob.as_ref());
    assert_eq!(Some(&descs[1]), child.info().blob.as_ref());

    // The child's layer holds only its own change
    let reader = remotes[0].provider.reader_at(&descs[1]).await.unwrap();
    let tar = Compression::Zstd.decode(reader.as_bytes()).unwrap();
    let mut archive = tar::Archive::new(tar.as_slice());
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.trim_end_matches('/') == "child"));
    assert!(!names.iter().any(|n| n.trim_end_matches('/') == "base"));

    child.release().await.unwrap();
    base.release().await.unwrap();
}

#[tokio::test]
async fn forced_conversions_close_over_variants() {
    let store = store();
    let m = open(&store).await;
    let cancel = CancellationToken::new();

    let r = committed(&m, None, &[("file", "payload")]).await;
    let gzip = r
        .get_remotes(true, &config(Compression::Gzip, false), false, &cancel)
        .await
        .unwrap();
    let diff_id = gzip[0].descriptors[0].diff_id().unwrap();

    // Without force the existing blob is returned as is
    let unforced = r
        .get_remotes(true, &config(Compression::Zstd, false), false, &cancel)
        .await
        .unwrap();
    assert_eq!(unforced[0].descriptors, gzip[0].descriptors);

    for target in [Compression::Zstd, Compression::Uncompressed] {
        let remotes = r
            .get_remotes(true, &config(target, true), false, &cancel)
            .await
            .unwrap();
        assert_eq!(remotes[0].descriptors[0].media_type, target.media_type());
    }

    for c in [Compression::Gzip, Compression::Zstd, Compression::Uncompressed] {
        let desc = r.get_blob_with_compression(c).await.unwrap();
        assert_eq!(Compression::from_descriptor(&desc).unwrap(), c);
        let bytes = m.content().reader_at(&desc).await.unwrap();
        let tar = c.decode(bytes.as_bytes()).unwrap();
        assert_eq!(Digest::from_bytes(&tar), diff_id);
    }

    let all = r
        .get_remotes(true, &config(Compression::Gzip, false), true, &cancel)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);

    // The base blob stays the one first computed
    assert_eq!(r.info().blob.as_ref(), Some(&gzip[0].descriptors[0]));
    r.release().await.unwrap();
}

#[tokio::test]
async fn estargz_is_not_produced() {
    let store = store();
    let m = open(&store).await;

    let r = committed(&m, None, &[("file", "x")]).await;
    let err = r
        .get_remotes(
            true,
            &config(Compression::EStargz, false),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::UnsupportedCompression(_)), "got {err}");
    r.release().await.unwrap();
}

#[tokio::test]
async fn set_blob_links_variants_and_rejects_other_content() {
    let store = store();
    let m = open(&store).await;
    let content = m.content();

    let tar = layer_tar(&[("a", "1")]);
    let (gz, gz_blob) = layer_blob(&tar, Compression::Gzip);
    let (zst, zst_blob) = layer_blob(&tar, Compression::Zstd);
    let (other, other_blob) = layer_blob(&layer_tar(&[("a", "2")]), Compression::Gzip);
    for (desc, blob) in [(&gz, gz_blob), (&zst, zst_blob), (&other, other_blob)] {
        content
            .write("test", blob, Some(&desc.digest), Default::default())
            .await
            .unwrap();
    }

    let r = committed(&m, None, &[("a", "1")]).await;
    r.set_blob(gz.clone()).await.unwrap();
    r.set_blob(gz.clone()).await.unwrap();
    assert_eq!(r.info().blob.as_ref(), Some(&gz));

    r.set_blob(zst.clone()).await.unwrap();
    assert_eq!(r.info().blob.as_ref(), Some(&gz));
    let found = r.get_blob_with_compression(Compression::Zstd).await.unwrap();
    assert_eq!(found.digest, zst.digest);

    let err = r.set_blob(other).await.unwrap_err();
    assert!(matches!(err, CacheError::ContentMismatch { .. }), "got {err}");

    let err = r
        .get_blob_with_compression(Compression::Uncompressed)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    r.release().await.unwrap();
}

#[tokio::test]
async fn non_distributable_layers_are_rewritten() {
    let store = store();
    let m = open(&store).await;
    let cancel = CancellationToken::new();

    let tar = layer_tar(&[("foreign", "layer")]);
    let (gz, blob) = layer_blob(&tar, Compression::Gzip);
    let mut foreign = Descriptor::new(
        media_types::OCI_LAYER_NONDISTRIBUTABLE_GZIP,
        gz.digest.clone(),
        gz.size,
    )
    .with_uncompressed(&Digest::from_bytes(&tar));
    foreign.urls = vec!["https://example.com/layer.tar.gz".to_string()];
    let (_provider, handlers) = memory_handlers(&[blob]);

    let r = m.get_by_blob(&foreign, None, handlers).await.unwrap();

    let plain = r
        .get_remotes(false, &config(Compression::Gzip, false), false, &cancel)
        .await
        .unwrap();
    let desc = &plain[0].descriptors[0];
    assert_eq!(desc.media_type, media_types::OCI_LAYER_GZIP);
    assert!(desc.urls.is_empty());
    // The lazy blob is still served through the handler
    assert!(plain[0].provider.reader_at(desc).await.is_ok());

    let keep = RefConfig {
        prefer_non_distributable: true,
        ..config(Compression::Gzip, false)
    };
    let preserved = r.get_remotes(false, &keep, false, &cancel).await.unwrap();
    let desc = &preserved[0].descriptors[0];
    assert_eq!(desc.media_type, media_types::OCI_LAYER_NONDISTRIBUTABLE_GZIP);
    assert_eq!(desc.urls, foreign.urls);
    r.release().await.unwrap();
}

#[tokio::test]
async fn cancelled_export_stops() {
    let store = store();
    let m = open(&store).await;

    let r = committed(&m, None, &[("file", "x")]).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = r
        .get_remotes(true, &config(Compression::Gzip, false), false, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Cancelled), "got {err}");
    assert!(r.info().blob.is_none());
    r.release().await.unwrap();
}

#[tokio::test]
async fn directory_replaced_by_file_exports_and_rebuilds() {
    let store = store();
    let m = open(&store).await;
    let cancel = CancellationToken::new();

    let base = committed(&m, None, &[("d/x", "inner"), ("d/sub/y", "deep")]).await;
    let mref = m.new_ref(Some(&base), RecordOptions::default()).await.unwrap();
    {
        let mounts = mref.mount(false).await.unwrap();
        std::fs::remove_dir_all(mount_path(&mounts).unwrap().join("d")).unwrap();
    }
    write_file(&mref, "d", "now a file").await;
    let top = mref.commit().await.unwrap();
    top.finalize().await.unwrap();

    let delta = m
        .diff(Some(&base), Some(&top), RecordOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read_file(&delta, "d").await.as_deref(), Some("now a file"));

    let remotes = top
        .get_remotes(true, &config(Compression::Gzip, false), false, &cancel)
        .await
        .unwrap();
    let descs = remotes[0].descriptors.clone();
    assert_eq!(descs.len(), 2);

    // The exported chain rebuilds the same tree elsewhere
    let mut blobs = vec![];
    for desc in &descs {
        let reader = remotes[0].provider.reader_at(desc).await.unwrap();
        blobs.push(reader.as_bytes().to_vec());
    }
    let other = crate::common::store();
    let m2 = open(&other).await;
    let (_provider, handlers) = memory_handlers(&blobs);
    let lower = m2.get_by_blob(&descs[0], None, handlers.clone()).await.unwrap();
    let upper = m2.get_by_blob(&descs[1], Some(&lower), handlers).await.unwrap();
    assert_eq!(read_file(&upper, "d").await.as_deref(), Some("now a file"));
    assert_eq!(read_file(&upper, "d/x").await, None);

    for r in [upper, lower] {
        r.release().await.unwrap();
    }
    for r in [delta, top, base] {
        r.release().await.unwrap();
    }
}
