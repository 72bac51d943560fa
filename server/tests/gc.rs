//! Garbage collection behavior.

mod common;

use std::fs::File;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use sea_orm::ActiveValue::Set;

use common::{sample_hash, spawn_node, TestNode};
use narpool_server::database::entity::store_path;
use narpool_server::database::NarpoolDatabase;
use narpool_server::dht::Dht;
use narpool_server::gc;

const DAY: u64 = 24 * 3600;

/// Writes an artifact file plus its record, backdating the file mtime
/// by `age_days`.
async fn plant_artifact(
    test_node: &TestNode,
    id: &str,
    store_hash: &str,
    suffix: &str,
    file_hash: &str,
    references: &str,
    age_days: u64,
) {
    let cache = test_node.cache();
    let backend = &cache.storage.backends()[0];
    let file_name = format!("{}.nar.xz", file_hash);

    backend.new_file(&file_name, b"artifact").await.unwrap();

    if age_days > 0 {
        let file = File::options()
            .write(true)
            .open(test_node.storage_root.join(&file_name))
            .unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_days * DAY))
            .unwrap();
    }

    cache
        .database
        .insert_store_path(store_path::ActiveModel {
            id: Set(id.to_string()),
            store_hash: Set(store_hash.to_string()),
            store_suffix: Set(suffix.to_string()),
            file_hash: Set(file_hash.to_string()),
            file_size: Set(8),
            nar_hash: Set(format!("sha256:{}", file_hash)),
            nar_size: Set(8),
            deriver: Set(String::new()),
            refs: Set(references.to_string()),
            storage_id: Set(backend.id().to_string()),
        })
        .await
        .unwrap();
}

/// Scenario: A is fresh and references the expired B; C is expired and
/// unreferenced. One pass keeps A and B and removes C.
#[tokio::test]
async fn test_reference_graph_preservation() {
    let test_node = spawn_node("keeper", "public", 18301, 7, Dht::memory()).await;
    let cache = test_node.cache();

    let hash_a = sample_hash('a');
    let hash_b = sample_hash('b');
    let hash_c = sample_hash('c');
    let file_a = sample_hash('d');
    let file_b = sample_hash('e');
    let file_c = sample_hash('f');

    plant_artifact(
        &test_node,
        "rec-a",
        &hash_a,
        "app",
        &file_a,
        &format!("{}-lib", hash_b),
        0,
    )
    .await;
    plant_artifact(&test_node, "rec-b", &hash_b, "lib", &file_b, "", 10).await;
    plant_artifact(&test_node, "rec-c", &hash_c, "tmp", &file_c, "", 10).await;

    gc::collect_garbage_once(&cache, Utc::now()).await.unwrap();

    let backend = &cache.storage.backends()[0];

    // A and B survive, file and record both.
    assert!(backend
        .find(&format!("{}.nar.xz", file_a), true)
        .await
        .unwrap()
        .is_some());
    assert!(backend
        .find(&format!("{}.nar.xz", file_b), true)
        .await
        .unwrap()
        .is_some());

    // C is gone, file and record both.
    assert!(backend
        .find(&format!("{}.nar.xz", file_c), true)
        .await
        .unwrap()
        .is_none());

    let remaining = cache
        .database
        .list_store_paths(&cache.storage.storage_ids())
        .await
        .unwrap();
    let mut names: Vec<String> = remaining.iter().map(|r| r.store_hash.clone()).collect();
    names.sort();

    let mut expected = vec![hash_a, hash_b];
    expected.sort();
    assert_eq!(expected, names);
}

/// Unlimited retention never expires recorded artifacts.
#[tokio::test]
async fn test_unlimited_retention() {
    let test_node = spawn_node("eternal", "public", 18303, -1, Dht::memory()).await;
    let cache = test_node.cache();

    let hash = sample_hash('1');
    let file = sample_hash('2');
    plant_artifact(&test_node, "rec", &hash, "pkg", &file, "", 400).await;

    gc::collect_garbage_once(&cache, Utc::now()).await.unwrap();

    assert!(cache.storage.backends()[0]
        .find(&format!("{}.nar.xz", file), true)
        .await
        .unwrap()
        .is_some());
}

/// Recordless files: fresh ones are in-flight uploads and stay; old
/// ones are debris and go. Reserved key material is never touched.
#[tokio::test]
async fn test_stray_files() {
    let test_node = spawn_node("sweeper", "public", 18305, 7, Dht::memory()).await;
    let cache = test_node.cache();
    let backend = &cache.storage.backends()[0];

    // A reserved upload that is still in flight.
    backend
        .new_file("11111111-2222-3333-4444-555555555555.nar.xz", b"")
        .await
        .unwrap();

    // Debris from an interrupted upload, two days old.
    backend.new_file("debris.nar.xz", b"junk").await.unwrap();
    let file = File::options()
        .write(true)
        .open(test_node.storage_root.join("debris.nar.xz"))
        .unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(2 * DAY))
        .unwrap();

    gc::collect_garbage_once(&cache, Utc::now()).await.unwrap();

    assert!(backend
        .find("11111111-2222-3333-4444-555555555555.nar.xz", true)
        .await
        .unwrap()
        .is_some());
    assert!(backend.find("debris.nar.xz", true).await.unwrap().is_none());

    // Key material survives every pass.
    assert!(backend.find("key.priv", true).await.unwrap().is_some());
    assert!(backend.find("key.pub", true).await.unwrap().is_some());
}

/// Expired chains: an expired parent rescued by a fresh root also
/// rescues its own expired references on the second pass.
#[tokio::test]
async fn test_transitive_rescue() {
    let test_node = spawn_node("chains", "public", 18307, 7, Dht::memory()).await;
    let cache = test_node.cache();

    let root = sample_hash('3');
    let mid = sample_hash('4');
    let leaf = sample_hash('5');
    let file_root = sample_hash('6');
    let file_mid = sample_hash('7');
    let file_leaf = sample_hash('8');

    // leaf <- mid <- root(fresh); queue order puts leaf before mid so
    // the rescue only lands on leaf's second visit.
    plant_artifact(&test_node, "rec-leaf", &leaf, "leaf", &file_leaf, "", 10).await;
    plant_artifact(
        &test_node,
        "rec-mid",
        &mid,
        "mid",
        &file_mid,
        &format!("{}-leaf", leaf),
        10,
    )
    .await;
    plant_artifact(
        &test_node,
        "rec-root",
        &root,
        "root",
        &file_root,
        &format!("{}-mid", mid),
        0,
    )
    .await;

    gc::collect_garbage_once(&cache, Utc::now()).await.unwrap();

    let remaining = cache
        .database
        .list_store_paths(&cache.storage.storage_ids())
        .await
        .unwrap();

    assert_eq!(3, remaining.len());
}
