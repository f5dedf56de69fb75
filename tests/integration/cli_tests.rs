//! Command-line front end

use crate::common::{committed, open, store, Store};
use assert_cmd::{cargo::cargo_bin_cmd, Command};
use predicates::prelude::*;
use std::path::PathBuf;

fn snapcache(store: &Store) -> Command {
    let config = store.dir.path().join("config.toml");
    if !config.exists() {
        std::fs::write(
            &config,
            format!("[store]\nroot = {:?}\nmount_pool_size = 4\n", store.config.root),
        )
        .unwrap();
    }
    let mut cmd = cargo_bin_cmd!("snapcache");
    cmd.env("SNAPCACHE_CONFIG", config);
    cmd
}

#[test]
fn help_displays() {
    cargo_bin_cmd!("snapcache")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build cache"));
}

#[test]
fn version_displays() {
    cargo_bin_cmd!("snapcache")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("snapcache"));
}

#[test]
fn du_empty_store() {
    let store = store();
    snapcache(&store)
        .arg("du")
        .assert()
        .success()
        .stdout(predicate::str::contains("No cache records found"));
    snapcache(&store)
        .args(["du", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn prune_empty_store() {
    let store = store();
    snapcache(&store)
        .arg("prune")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to prune"));
}

#[test]
fn bad_filter_fails() {
    let store = store();
    snapcache(&store)
        .args(["prune", "--filter", "size>10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn config_path_uses_override() {
    let store = store();
    snapcache(&store)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn config_show() {
    let store = store();
    snapcache(&store)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[store]"))
        .stdout(predicate::str::contains("mount_pool_size = 4"));
}

#[test]
fn config_init_refuses_overwrite() {
    let dir = tempfile::TempDir::new().unwrap();
    let path: PathBuf = dir.path().join("fresh").join("config.toml");

    cargo_bin_cmd!("snapcache")
        .env("SNAPCACHE_CONFIG", &path)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration initialized"));
    assert!(path.exists());

    cargo_bin_cmd!("snapcache")
        .env("SNAPCACHE_CONFIG", &path)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
}

#[test]
fn invalid_config_shows_hint() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[store\n").unwrap();

    cargo_bin_cmd!("snapcache")
        .env("SNAPCACHE_CONFIG", &path)
        .arg("du")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Hint:"));
}

#[tokio::test]
async fn du_and_prune_existing_records() {
    let store = store();
    let id = {
        let m = open(&store).await;
        let r = committed(&m, None, &[("file", "content")]).await;
        let id = r.id().to_string();
        r.release().await.unwrap();
        m.close().await.unwrap();
        id
    };

    snapcache(&store)
        .args(["du", "--format", "plain"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));

    snapcache(&store)
        .args(["prune", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Would remove"));

    snapcache(&store)
        .args(["prune", "--format", "plain"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));

    snapcache(&store)
        .arg("du")
        .assert()
        .success()
        .stdout(predicate::str::contains("No cache records found"));
}
