//! Nix Binary Cache server.
//!
//! This is the per-cache surface Nix substituters talk to. Lookups
//! resolve in a fixed order: owned records first, then records of
//! sibling caches on the same node, then peers discovered through the
//! DHT. Only an owned record counts as a hit.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::instrument;
use uuid::Uuid;

use crate::database::{NarpoolDatabase, StorePathQuery};
use crate::error::{ServerError, ServerResult};
use crate::narinfo::Compression;
use crate::{CacheState, NodeState};
use narpool::mime;

/// Body of `/nix-cache-info`.
pub const NIX_CACHE_INFO: &str = "Priority: 30\nStoreDir: /nix/store\nWantMassQuery: 1\n";

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/nix-cache-info", get(get_nix_cache_info))
        .route("/nar/:path", get(get_nar))
        .route(
            "/:path",
            get(get_store_path_info)
                .head(head_store_path_info)
                .put(put_upload),
        )
}

/// Serves the static cache information.
#[instrument(skip_all)]
async fn get_nix_cache_info(Extension(cache): Extension<Arc<CacheState>>) -> Response {
    let started = Instant::now();

    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime::NIX_CACHE_INFO)],
        NIX_CACHE_INFO,
    )
        .into_response();

    cache.metrics.record_request(true, started.elapsed());

    response
}

/// Serves `{store_hash}.narinfo`.
#[instrument(skip_all, fields(cache = %cache.name, path = %path))]
#[axum_macros::debug_handler]
async fn get_store_path_info(
    Extension(node): Extension<Arc<NodeState>>,
    Extension(cache): Extension<Arc<CacheState>>,
    Path(path): Path<String>,
) -> ServerResult<Response> {
    let started = Instant::now();

    let result = resolve_narinfo(&node, &cache, &path).await;

    let hit = matches!(&result, Ok((true, _)));
    cache.metrics.record_request(hit, started.elapsed());

    result.map(|(_, response)| response)
}

async fn resolve_narinfo(
    node: &NodeState,
    cache: &CacheState,
    path: &str,
) -> ServerResult<(bool, Response)> {
    let store_hash = path
        .strip_suffix(".narinfo")
        .filter(|hash| is_hash(hash))
        .ok_or(ServerError::NotFound)?;

    // Owned record.
    if let Some(record) = cache
        .database
        .find_store_path(
            &cache.storage.storage_ids(),
            StorePathQuery::StoreHash(store_hash),
        )
        .await?
    {
        let narinfo = cache.get_narinfo(&record).await?;
        return Ok((true, narinfo.into_response()));
    }

    // A sibling cache on this node may hold it; its narinfo is re-signed
    // with our key.
    for other in node.caches.iter().filter(|other| other.id != cache.id) {
        if let Some(record) = cache
            .database
            .find_store_path(
                &other.storage.storage_ids(),
                StorePathQuery::StoreHash(store_hash),
            )
            .await?
        {
            let mut narinfo = other.build_narinfo(&record).await?;
            narinfo.sign(&cache.keypair().await?);
            return Ok((false, narinfo.into_response()));
        }
    }

    // A peer discovered through the DHT.
    if let Some(peer_url) = cache.remote.best_peer(store_hash).await {
        tracing::debug!("Fetching {}.narinfo from {}", store_hash, peer_url);

        let keypair = cache.keypair().await?;
        let narinfo = cache
            .remote
            .fetch_narinfo(store_hash, &peer_url, &keypair)
            .await?;

        return Ok((false, narinfo.into_response()));
    }

    Err(ServerError::NotFound)
}

/// Answers whether this cache owns a store hash.
#[instrument(skip_all, fields(cache = %cache.name, path = %path))]
async fn head_store_path_info(
    Extension(cache): Extension<Arc<CacheState>>,
    Path(path): Path<String>,
) -> ServerResult<StatusCode> {
    let Some(store_hash) = path.strip_suffix(".narinfo").filter(|hash| is_hash(hash)) else {
        return Ok(StatusCode::BAD_REQUEST);
    };

    let record = cache
        .database
        .find_store_path(
            &cache.storage.storage_ids(),
            StorePathQuery::StoreHash(store_hash),
        )
        .await?;

    Ok(if record.is_some() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    })
}

/// Serves `nar/{file_hash}.nar.{codec}`.
#[instrument(skip_all, fields(cache = %cache.name, path = %path))]
async fn get_nar(
    Extension(node): Extension<Arc<NodeState>>,
    Extension(cache): Extension<Arc<CacheState>>,
    Path(path): Path<String>,
) -> ServerResult<Response> {
    let started = Instant::now();

    let result = resolve_nar(&node, &cache, &path).await;

    let hit = matches!(&result, Ok((true, _)));
    cache.metrics.record_request(hit, started.elapsed());

    result.map(|(_, response)| response)
}

async fn resolve_nar(
    node: &NodeState,
    cache: &CacheState,
    path: &str,
) -> ServerResult<(bool, Response)> {
    Compression::from_file_name(path).map_err(|_| ServerError::NotFound)?;

    let (file_hash, _) = path.split_once(".nar.").ok_or(ServerError::NotFound)?;
    if !is_hash(file_hash) {
        return Err(ServerError::NotFound);
    }

    // Owned artifact.
    if let Some(response) = read_local_nar(cache, cache, file_hash, path).await? {
        return Ok((true, response));
    }

    // Sibling caches on this node.
    for other in node.caches.iter().filter(|other| other.id != cache.id) {
        if let Some(response) = read_local_nar(cache, other, file_hash, path).await? {
            return Ok((false, response));
        }
    }

    // The peer memoized when the narinfo was resolved.
    let nar_path = format!("nar/{}", path);
    if let Some(peer_url) = cache.remote.peer_for(&nar_path) {
        tracing::debug!("Fetching {} from {}", nar_path, peer_url);

        let body = cache.remote.fetch_nar(&nar_path, &peer_url).await?;
        return Ok((false, nar_response(body)));
    }

    Err(ServerError::NotFound)
}

/// Tries to serve a NAR from the record and back-ends of `holder`.
async fn read_local_nar(
    requester: &CacheState,
    holder: &CacheState,
    file_hash: &str,
    file_name: &str,
) -> ServerResult<Option<Response>> {
    let record = requester
        .database
        .find_store_path(
            &holder.storage.storage_ids(),
            StorePathQuery::FileHash(file_hash),
        )
        .await?;

    if record.is_none() {
        return Ok(None);
    }

    match holder.storage.find(file_name).await? {
        Some((name, backend)) => match backend.read(&name).await {
            Ok(body) => Ok(Some(nar_response(body))),
            // The record exists but the artifact is gone; fall through
            // to the next resolution step.
            Err(ServerError::NoSuchObject) => Ok(None),
            Err(e) => Err(e),
        },
        None => Ok(None),
    }
}

fn nar_response(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime::NAR)],
        body,
    )
        .into_response()
}

/// Receives the body of a reserved multipart upload.
#[instrument(skip_all, fields(cache = %cache.name, upload = %upload))]
async fn put_upload(
    Extension(cache): Extension<Arc<CacheState>>,
    Path(upload): Path<String>,
    body: Bytes,
) -> ServerResult<Response> {
    Uuid::parse_str(&upload).map_err(|_| ServerError::NoSuchUpload)?;

    let (file_name, backend) = cache
        .storage
        .find(&upload)
        .await?
        .ok_or(ServerError::NoSuchUpload)?;

    cache.dht.put(&file_name, &cache.id).await;

    backend.save(&file_name, &body).await?;

    Ok((
        StatusCode::CREATED,
        [(header::CONTENT_LOCATION, "/")],
    )
        .into_response())
}

fn is_hash(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
