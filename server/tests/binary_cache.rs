//! End-to-end tests of the per-cache binary cache surface.

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request};
use tower::ServiceExt;

use common::{
    basic, bearer, body_bytes, sample_hash, send, spawn_node, upload_artifact,
};
use narpool_server::database::{NarpoolDatabase, StorePathQuery};
use narpool_server::dht::Dht;
use narpool_server::narinfo::NarInfo;
use narpool::signing::NixPublicKey;

#[tokio::test]
async fn test_public_cache_local_hit() {
    let test_node = spawn_node("demo", "public", 18081, 4, Dht::memory()).await;
    let node = test_node.node.clone();
    let cache = test_node.cache();

    let store_hash = sample_hash('a');
    let file_hash = sample_hash('b');

    upload_artifact(
        &test_node,
        &store_hash,
        "pkg",
        &file_hash,
        "xz",
        &[0x00, 0x01, 0x02],
        vec![],
    )
    .await;

    // narinfo
    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::GET,
        &format!("/{}.narinfo", store_hash),
        None,
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());
    assert_eq!(
        "text/x-nix-narinfo",
        response.headers()[header::CONTENT_TYPE]
    );

    let manifest = String::from_utf8(body_bytes(response).await).unwrap();
    let narinfo = NarInfo::from_str(&manifest).unwrap();

    assert_eq!(format!("/nix/store/{}-pkg", store_hash), narinfo.store_path);
    assert_eq!(format!("nar/{}.nar.xz", file_hash), narinfo.url);

    // The signature must verify against the cache's public key.
    let public_key = NixPublicKey::from_str(&cache.public_key().await.unwrap()).unwrap();
    public_key
        .verify(&narinfo.fingerprint(), narinfo.signature().unwrap())
        .expect("served narinfo must carry a valid signature");

    // Serving the narinfo twice produces identical bytes.
    let again = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::GET,
        &format!("/{}.narinfo", store_hash),
        None,
        None,
    )
    .await;
    assert_eq!(manifest.as_bytes(), body_bytes(again).await.as_slice());

    // NAR bytes round-trip.
    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::GET,
        &format!("/nar/{}.nar.xz", file_hash),
        None,
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());
    assert_eq!(vec![0x00, 0x01, 0x02], body_bytes(response).await);

    // Counters stay consistent.
    let snapshot = cache.metrics.snapshot();
    assert_eq!(
        snapshot.request_count,
        snapshot.hit_count + snapshot.miss_count
    );
    assert!(snapshot.hit_count >= 3);
}

#[tokio::test]
async fn test_nix_cache_info() {
    let test_node = spawn_node("info", "public", 18083, 4, Dht::memory()).await;

    let response = send(
        narpool_server::cache_app(test_node.node.clone(), test_node.cache()),
        Method::GET,
        "/nix-cache-info",
        None,
        None,
    )
    .await;

    assert_eq!(200, response.status().as_u16());
    assert_eq!(
        b"Priority: 30\nStoreDir: /nix/store\nWantMassQuery: 1\n".to_vec(),
        body_bytes(response).await
    );
}

#[tokio::test]
async fn test_private_cache_authorization() {
    let test_node = spawn_node("sealed", "private", 18085, 4, Dht::memory()).await;
    let node = test_node.node.clone();
    let cache = test_node.cache();

    // No credentials.
    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::GET,
        "/nix-cache-info",
        None,
        None,
    )
    .await;
    assert_eq!(401, response.status().as_u16());

    // Wrong token.
    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::GET,
        "/nix-cache-info",
        Some(&basic("not-the-token")),
        None,
    )
    .await;
    assert_eq!(401, response.status().as_u16());

    // Correct token.
    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::GET,
        "/nix-cache-info",
        Some(&basic(&cache.token)),
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());
}

#[tokio::test]
async fn test_head_narinfo() {
    let test_node = spawn_node("heads", "public", 18087, 4, Dht::memory()).await;
    let node = test_node.node.clone();
    let cache = test_node.cache();

    let store_hash = sample_hash('c');
    let file_hash = sample_hash('d');

    upload_artifact(
        &test_node,
        &store_hash,
        "pkg",
        &file_hash,
        "zst",
        b"zstd bytes",
        vec![],
    )
    .await;

    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::HEAD,
        &format!("/{}.narinfo", store_hash),
        None,
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());

    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::HEAD,
        &format!("/{}.narinfo", sample_hash('9')),
        None,
        None,
    )
    .await;
    assert_eq!(400, response.status().as_u16());
}

#[tokio::test]
async fn test_missing_artifacts_404() {
    let test_node = spawn_node("empty", "public", 18089, 4, Dht::memory()).await;
    let node = test_node.node.clone();
    let cache = test_node.cache();

    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::GET,
        &format!("/{}.narinfo", sample_hash('e')),
        None,
        None,
    )
    .await;
    assert_eq!(404, response.status().as_u16());

    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::GET,
        &format!("/nar/{}.nar.xz", sample_hash('f')),
        None,
        None,
    )
    .await;
    assert_eq!(404, response.status().as_u16());

    // Unknown codecs don't exist on this surface at all.
    let response = send(
        narpool_server::cache_app(node.clone(), cache.clone()),
        Method::GET,
        &format!("/nar/{}.nar.br", sample_hash('f')),
        None,
        None,
    )
    .await;
    assert_eq!(404, response.status().as_u16());

    let snapshot = cache.metrics.snapshot();
    assert_eq!(0, snapshot.hit_count);
    assert_eq!(snapshot.request_count, snapshot.miss_count);
}

#[tokio::test]
async fn test_upload_abort_leaves_nothing() {
    let test_node = spawn_node("aborts", "public", 18091, 4, Dht::memory()).await;
    let node = test_node.node.clone();
    let cache = test_node.cache();
    let token = bearer(&cache.token);

    let response = send(
        narpool_server::node_app(node.clone()),
        Method::POST,
        "/api/v1/cache/aborts/multipart-nar?compression=xz",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());

    let reply: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let upload_id = reply["uploadId"].as_str().unwrap().to_string();

    // The reserved file exists until the abort.
    assert!(cache.storage.find(&upload_id).await.unwrap().is_some());

    let response = send(
        narpool_server::node_app(node.clone()),
        Method::POST,
        &format!("/api/v1/cache/aborts/multipart-nar/{}/abort", upload_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());

    // No file on any back-end, no store path row.
    assert!(cache.storage.find(&upload_id).await.unwrap().is_none());
    for backend in cache.storage.backends() {
        assert!(backend.find(&upload_id, false).await.unwrap().is_none());
    }

    let rows = cache
        .database
        .list_store_paths(&cache.storage.storage_ids())
        .await
        .unwrap();
    assert!(rows.is_empty());

    // Abort of an unknown id is a 400.
    let response = send(
        narpool_server::node_app(node.clone()),
        Method::POST,
        &format!("/api/v1/cache/aborts/multipart-nar/{}/abort", upload_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(400, response.status().as_u16());
}

#[tokio::test]
async fn test_complete_is_not_repeatable() {
    let test_node = spawn_node("once", "public", 18093, 4, Dht::memory()).await;
    let node = test_node.node.clone();
    let cache = test_node.cache();
    let token = bearer(&cache.token);

    let store_hash = sample_hash('1');
    let file_hash = sample_hash('2');

    upload_artifact(
        &test_node,
        &store_hash,
        "pkg",
        &file_hash,
        "xz",
        b"payload",
        vec![],
    )
    .await;

    // The reserved file is gone after the rename, so a second complete
    // must be rejected.
    let response = send(
        narpool_server::node_app(node.clone()),
        Method::POST,
        &format!(
            "/api/v1/cache/once/multipart-nar/{}/complete",
            "00000000-0000-0000-0000-000000000000"
        ),
        Some(&token),
        Some(serde_json::json!({
            "narInfoCreate": {
                "cStoreHash": store_hash,
                "cStoreSuffix": "pkg",
                "cFileHash": file_hash,
                "cFileSize": 7,
                "cNarHash": format!("sha256:{}", file_hash),
                "cNarSize": 7,
                "cDeriver": "",
                "cReferences": [],
            }
        })),
    )
    .await;
    assert_eq!(400, response.status().as_u16());

    // Exactly one record was written.
    let record = cache
        .database
        .find_store_path(
            &cache.storage.storage_ids(),
            StorePathQuery::FileHash(&file_hash),
        )
        .await
        .unwrap();
    assert!(record.is_some());
    assert_eq!(
        1,
        cache
            .database
            .list_store_paths(&cache.storage.storage_ids())
            .await
            .unwrap()
            .len()
    );
}

#[tokio::test]
async fn test_upload_body_put_requires_reservation() {
    let test_node = spawn_node("strict", "public", 18095, 4, Dht::memory()).await;
    let node = test_node.node.clone();
    let cache = test_node.cache();

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/11111111-2222-3333-4444-555555555555")
        .body(Body::from("data"))
        .unwrap();

    let response = narpool_server::cache_app(node, cache)
        .oneshot(request)
        .await
        .unwrap();

    assert_eq!(400, response.status().as_u16());
}
