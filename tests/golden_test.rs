use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use munin::{FileSnapshotStore, GoldenStore};

#[tokio::test]
async fn snapshots_survive_a_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let store = GoldenStore::open(Arc::new(FileSnapshotStore::new(dir.path())))
        .await
        .unwrap();
    store
        .set("btc-history", json!({"prices": [67000.0, 67421.5]}))
        .await
        .unwrap();
    store.set("etf-flows", json!([1.2, -0.4])).await.unwrap();
    drop(store);

    // Same directory, fresh process.
    let reopened = GoldenStore::open(Arc::new(FileSnapshotStore::new(dir.path())))
        .await
        .unwrap();
    assert_eq!(reopened.len().await, 2);

    let (payload, age) = reopened.get("btc-history").await.expect("persisted");
    assert_eq!(payload, json!({"prices": [67000.0, 67421.5]}));
    assert!(age < Duration::from_secs(60));
}

#[tokio::test]
async fn set_replaces_the_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = GoldenStore::open(Arc::new(FileSnapshotStore::new(dir.path())))
        .await
        .unwrap();

    store.set("btc-history", json!([1])).await.unwrap();
    store.set("btc-history", json!([1, 2])).await.unwrap();

    let reopened = GoldenStore::open(Arc::new(FileSnapshotStore::new(dir.path())))
        .await
        .unwrap();
    let (payload, _) = reopened.get("btc-history").await.unwrap();
    assert_eq!(payload, json!([1, 2]));
}

#[tokio::test]
async fn remove_deletes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = GoldenStore::open(Arc::new(FileSnapshotStore::new(dir.path())))
        .await
        .unwrap();

    store.set("btc-history", json!([1])).await.unwrap();
    store.remove("btc-history").await.unwrap();
    // Removing twice is fine.
    store.remove("btc-history").await.unwrap();

    let reopened = GoldenStore::open(Arc::new(FileSnapshotStore::new(dir.path())))
        .await
        .unwrap();
    assert!(reopened.is_empty().await);
}

#[tokio::test]
async fn corrupt_snapshot_file_loses_one_dataset_not_all() {
    let dir = tempfile::tempdir().unwrap();
    let store = GoldenStore::open(Arc::new(FileSnapshotStore::new(dir.path())))
        .await
        .unwrap();
    store.set("good", json!([1])).await.unwrap();
    drop(store);

    std::fs::write(dir.path().join("bad.json"), b"{ not json").unwrap();

    let reopened = GoldenStore::open(Arc::new(FileSnapshotStore::new(dir.path())))
        .await
        .unwrap();
    assert_eq!(reopened.len().await, 1);
    assert!(reopened.get("good").await.is_some());
    assert!(reopened.get("bad").await.is_none());
}

#[tokio::test]
async fn open_on_missing_directory_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("never-created");

    let store = GoldenStore::open(Arc::new(FileSnapshotStore::new(&missing)))
        .await
        .unwrap();
    assert!(store.is_empty().await);

    // First write creates the directory.
    store.set("btc-history", json!([1])).await.unwrap();
    assert!(missing.join("btc-history.json").exists());
}

#[tokio::test]
async fn path_traversal_ids_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = GoldenStore::open(Arc::new(FileSnapshotStore::new(dir.path())))
        .await
        .unwrap();

    assert!(store.set("../escape", json!([1])).await.is_err());
    assert!(store.set("", json!([1])).await.is_err());
}
