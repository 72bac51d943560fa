#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{Body, HttpBody};
use axum::http::{header, Method, Request, Response};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::json;
use tower::ServiceExt;

use narpool_server::config::Config;
use narpool_server::dht::Dht;
use narpool_server::provision;
use narpool_server::{CacheState, NodeState};

pub struct TestNode {
    pub node: Arc<NodeState>,
    pub storage_root: PathBuf,
    _tmp: tempfile::TempDir,
}

impl TestNode {
    pub fn cache(&self) -> Arc<CacheState> {
        self.node.caches[0].clone()
    }
}

/// Provisions a single-cache node over a scratch directory.
pub async fn spawn_node(
    name: &str,
    access: &str,
    port: u16,
    retention: i64,
    dht: Dht,
) -> TestNode {
    let tmp = tempfile::tempdir().unwrap();
    let storage_root = tmp.path().join("storage");
    let database = tmp.path().join("node.db");

    let yaml = format!(
        r#"
server:
  database: {database}
  hostname: 127.0.0.1
  standalone: true
  server-port: {server_port}
caches:
  - name: {name}
    port: {port}
    retention: {retention}
    access: {access}
    storages:
      - name: main
        type: local
        root: {root}
"#,
        database = database.display(),
        server_port = port + 1,
        name = name,
        port = port,
        retention = retention,
        access = access,
        root = storage_root.display(),
    );

    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.validate().unwrap();

    let connection = narpool_server::open_database(&config).await.unwrap();
    provision::apply(&connection, &config).await.unwrap();

    let node = NodeState::open(connection, dht, config.server.hostname.clone())
        .await
        .unwrap();

    TestNode {
        node,
        storage_root,
        _tmp: tmp,
    }
}

/// Loads a config without provisioning, for validation-only tests.
pub fn parse_config(yaml: &str) -> Config {
    serde_yaml::from_str(yaml).unwrap()
}

pub async fn body_bytes(response: Response<axum::body::BoxBody>) -> Vec<u8> {
    let mut body = response.into_body();
    let mut out = Vec::new();

    while let Some(chunk) = body.data().await {
        out.extend_from_slice(&chunk.unwrap());
    }

    out
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

pub fn basic(token: &str) -> String {
    format!("Basic {}", BASE64_STANDARD.encode(format!("user:{}", token)))
}

pub async fn send(
    app: axum::Router,
    method: Method,
    uri: &str,
    authorization: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response<axum::body::BoxBody> {
    let mut request = Request::builder().method(method).uri(uri);

    if let Some(authorization) = authorization {
        request = request.header(header::AUTHORIZATION, authorization);
    }

    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    app.oneshot(request).await.unwrap()
}

/// Drives the full multipart upload lifecycle of one artifact.
pub async fn upload_artifact(
    test_node: &TestNode,
    store_hash: &str,
    store_suffix: &str,
    file_hash: &str,
    codec: &str,
    body: &[u8],
    references: Vec<&str>,
) {
    let node = test_node.node.clone();
    let cache = test_node.cache();
    let token = bearer(&cache.token);

    // Reserve an upload slot.
    let response = send(
        narpool_server::node_app(node.clone()),
        Method::POST,
        &format!(
            "/api/v1/cache/{}/multipart-nar?compression={}",
            cache.name, codec
        ),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(200, response.status().as_u16());

    let reply: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    let upload_id = reply["uploadId"].as_str().unwrap().to_string();

    // PUT the body on the cache surface.
    let auth = basic(&cache.token);
    let request = Request::builder()
        .method(Method::PUT)
        .uri(format!("/{}", upload_id))
        .header(header::AUTHORIZATION, &auth)
        .body(Body::from(body.to_vec()))
        .unwrap();

    let response = narpool_server::cache_app(node.clone(), cache.clone())
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(201, response.status().as_u16());

    // Complete.
    let response = send(
        narpool_server::node_app(node.clone()),
        Method::POST,
        &format!(
            "/api/v1/cache/{}/multipart-nar/{}/complete",
            cache.name, upload_id
        ),
        Some(&token),
        Some(json!({
            "narInfoCreate": {
                "cStoreHash": store_hash,
                "cStoreSuffix": store_suffix,
                "cFileHash": file_hash,
                "cFileSize": body.len(),
                "cNarHash": format!("sha256:{}", file_hash),
                "cNarSize": body.len(),
                "cDeriver": format!("{}-{}.drv", store_hash, store_suffix),
                "cReferences": references,
            }
        })),
    )
    .await;
    assert_eq!(200, response.status().as_u16());
}

pub fn sample_hash(c: char) -> String {
    std::iter::repeat(c).take(32).collect()
}
