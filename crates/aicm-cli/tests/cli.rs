//! End-to-end tests for the aicm-queue binary.

use aicm_delivery::SqliteQueueStore;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

fn seed_queue(dir: &TempDir, failed: usize) -> PathBuf {
    let path = dir.path().join("queue.db");
    let store = SqliteQueueStore::open(&path).unwrap();
    for i in 0..failed {
        store.enqueue(&format!("{{\"n\":{}}}", i)).unwrap();
    }
    for entry in store.claim_batch(failed).unwrap() {
        store.mark_failed(entry.id, "upstream 503").unwrap();
    }
    path
}

#[test]
fn stats_reports_counts() {
    let dir = TempDir::new().unwrap();
    let path = seed_queue(&dir, 2);

    Command::cargo_bin("aicm-queue")
        .unwrap()
        .args(["--db-path", path.to_str().unwrap(), "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failed    2"));
}

#[test]
fn list_failed_shows_entries() {
    let dir = TempDir::new().unwrap();
    let path = seed_queue(&dir, 1);

    Command::cargo_bin("aicm-queue")
        .unwrap()
        .args(["--db-path", path.to_str().unwrap(), "list-failed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("upstream 503"));
}

#[test]
fn requeue_then_stats_shows_queued() {
    let dir = TempDir::new().unwrap();
    let path = seed_queue(&dir, 3);

    Command::cargo_bin("aicm-queue")
        .unwrap()
        .args(["--db-path", path.to_str().unwrap(), "requeue"])
        .assert()
        .success()
        .stdout(predicate::str::contains("requeued 3 entries"));

    let store = SqliteQueueStore::open(&path).unwrap();
    assert_eq!(store.stats().unwrap().queued, 3);
}

#[test]
fn purge_removes_entries() {
    let dir = TempDir::new().unwrap();
    let path = seed_queue(&dir, 2);

    Command::cargo_bin("aicm-queue")
        .unwrap()
        .args(["--db-path", path.to_str().unwrap(), "purge"])
        .assert()
        .success()
        .stdout(predicate::str::contains("purged 2 entries"));

    let store = SqliteQueueStore::open(&path).unwrap();
    assert_eq!(store.stats().unwrap().total(), 0);
}

#[test]
fn missing_database_exits_with_io_code() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing.db");

    Command::cargo_bin("aicm-queue")
        .unwrap()
        .args(["--db-path", path.to_str().unwrap(), "stats"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn missing_db_path_is_usage_error() {
    Command::cargo_bin("aicm-queue")
        .unwrap()
        .env_remove("AICM_DB_PATH")
        .arg("stats")
        .assert()
        .failure()
        .code(1);
}
