//! Cross-node artifact resolution through the DHT.

mod common;

use std::net::TcpListener;

use axum::http::Method;

use common::{body_bytes, sample_hash, send, spawn_node, upload_artifact};
use narpool_server::advertise;
use narpool_server::dht::Dht;
use narpool_server::narinfo::NarInfo;

/// A node that does not hold an artifact resolves the owner through
/// the DHT, fetches from it, and re-signs what it serves.
#[tokio::test]
async fn test_cross_peer_miss() {
    let dht = Dht::memory();

    // Node A really listens so node B can fetch from it.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port_a = listener.local_addr().unwrap().port();
    listener.set_nonblocking(true).unwrap();

    let node_a = spawn_node("origin", "public", port_a, 4, dht.clone()).await;
    let cache_a = node_a.cache();

    let store_hash = sample_hash('7');
    let file_hash = sample_hash('8');
    let payload = b"federated artifact bytes";

    upload_artifact(
        &node_a,
        &store_hash,
        "pkg",
        &file_hash,
        "xz",
        payload,
        vec![],
    )
    .await;

    // Publish A's descriptor; the upload already published the owner
    // mapping.
    advertise::advertise_once(&cache_a).await.unwrap();
    assert!(dht.get(&store_hash).await.is_some());

    let app_a = narpool_server::cache_app(node_a.node.clone(), cache_a.clone());
    let server = axum::Server::from_tcp(listener)
        .unwrap()
        .serve(app_a.into_make_service());
    let _server = tokio::spawn(server);

    // Node B shares the overlay but holds nothing.
    let node_b = spawn_node("mirror", "public", 18201, 4, dht.clone()).await;
    let cache_b = node_b.cache();

    let response = send(
        narpool_server::cache_app(node_b.node.clone(), cache_b.clone()),
        Method::GET,
        &format!("/{}.narinfo", store_hash),
        None,
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());

    let manifest = String::from_utf8(body_bytes(response).await).unwrap();
    let narinfo = NarInfo::from_str(&manifest).unwrap();

    // Re-signed with B's key, everything else preserved.
    let signature = narinfo.signature().unwrap();
    assert!(signature.starts_with(&format!("{}:", cache_b.key_name())));
    assert_eq!(format!("/nix/store/{}-pkg", store_hash), narinfo.store_path);

    // The NAR request is routed to the memoized peer and returns A's
    // bytes verbatim.
    let response = send(
        narpool_server::cache_app(node_b.node.clone(), cache_b.clone()),
        Method::GET,
        &format!("/nar/{}.nar.xz", file_hash),
        None,
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());
    assert_eq!(payload.to_vec(), body_bytes(response).await);

    // The memoized mapping is evicted after the fetch.
    assert!(cache_b
        .remote
        .peer_for(&format!("nar/{}.nar.xz", file_hash))
        .is_none());

    // Everything B served was a miss.
    let snapshot = cache_b.metrics.snapshot();
    assert_eq!(0, snapshot.hit_count);
    assert_eq!(2, snapshot.miss_count);
}

/// Standalone nodes never resolve remotely.
#[tokio::test]
async fn test_standalone_node_stays_local() {
    let node = spawn_node("alone", "public", 18203, 4, Dht::disabled()).await;
    let cache = node.cache();

    let response = send(
        narpool_server::cache_app(node.node.clone(), cache.clone()),
        Method::GET,
        &format!("/{}.narinfo", sample_hash('5')),
        None,
        None,
    )
    .await;

    assert_eq!(404, response.status().as_u16());
}

/// Sibling caches on one node serve each other's artifacts, re-signed.
#[tokio::test]
async fn test_sibling_cache_resolution() {
    // One node hosting two caches needs one config; build it by hand.
    let tmp = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
server:
  database: {database}
  hostname: 127.0.0.1
  standalone: true
caches:
  - name: first
    port: 18205
    storages:
      - name: main
        type: local
        root: {root_a}
  - name: second
    port: 18206
    storages:
      - name: main
        type: local
        root: {root_b}
"#,
        database = tmp.path().join("node.db").display(),
        root_a = tmp.path().join("a").display(),
        root_b = tmp.path().join("b").display(),
    );

    let config: narpool_server::config::Config = serde_yaml::from_str(&yaml).unwrap();
    config.validate().unwrap();

    let database = narpool_server::open_database(&config).await.unwrap();
    narpool_server::provision::apply(&database, &config).await.unwrap();

    let node = narpool_server::NodeState::open(database, Dht::memory(), "127.0.0.1".to_string())
        .await
        .unwrap();

    let first = node.cache_by_name("first").unwrap();
    let second = node.cache_by_name("second").unwrap();

    let store_hash = sample_hash('3');
    let file_hash = sample_hash('4');

    // Place the artifact directly into the first cache.
    let backend = &first.storage.backends()[0];
    backend
        .new_file(&format!("{}.nar.xz", file_hash), b"sibling bytes")
        .await
        .unwrap();

    use narpool_server::database::NarpoolDatabase;
    use sea_orm::ActiveValue::Set;

    node.database
        .insert_store_path(
            narpool_server::database::entity::store_path::ActiveModel {
                id: Set("record-1".to_string()),
                store_hash: Set(store_hash.clone()),
                store_suffix: Set("pkg".to_string()),
                file_hash: Set(file_hash.clone()),
                file_size: Set(13),
                nar_hash: Set(format!("sha256:{}", file_hash)),
                nar_size: Set(13),
                deriver: Set(String::new()),
                refs: Set(String::new()),
                storage_id: Set(backend.id().to_string()),
            },
        )
        .await
        .unwrap();

    // The second cache serves it, signed with its own key.
    let response = send(
        narpool_server::cache_app(node.clone(), second.clone()),
        Method::GET,
        &format!("/{}.narinfo", store_hash),
        None,
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());

    let narinfo =
        NarInfo::from_str(&String::from_utf8(body_bytes(response).await).unwrap()).unwrap();
    assert!(narinfo
        .signature()
        .unwrap()
        .starts_with(&format!("{}:", second.key_name())));

    let response = send(
        narpool_server::cache_app(node.clone(), second.clone()),
        Method::GET,
        &format!("/nar/{}.nar.xz", file_hash),
        None,
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());
    assert_eq!(b"sibling bytes".to_vec(), body_bytes(response).await);

    // Sibling serves count as misses for the serving cache.
    let snapshot = second.metrics.snapshot();
    assert_eq!(0, snapshot.hit_count);
}
