//! Node-level orchestration API.
//!
//! Upload clients drive the multipart NAR lifecycle through this
//! surface, and intra-machine peers reach the process-wide DHT through
//! `/api/v1/dht/{get,put}`. Every cache-scoped POST requires the
//! cache's bearer token.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sea_orm::ActiveValue::Set;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::access::{api_authorized, binary_cache_authorized};
use crate::database::entity::store_path;
use crate::database::{NarpoolDatabase, StorePathQuery};
use crate::error::{ServerError, ServerResult};
use crate::narinfo::Compression;
use crate::{CacheState, NodeState};

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/api/v1/dht/get/:key", get(dht_get))
        .route("/api/v1/dht/put", post(dht_put))
        .route("/api/v1/cache/:cache", get(get_cache_config))
        .route("/api/v1/cache/:cache/narinfo", post(get_missing_narinfo))
        .route(
            "/api/v1/cache/:cache/multipart-nar",
            post(initiate_multipart_nar),
        )
        .route(
            "/api/v1/cache/:cache/multipart-nar/:id",
            post(get_upload_url),
        )
        .route(
            "/api/v1/cache/:cache/multipart-nar/:id/complete",
            post(complete_multipart_nar),
        )
        .route(
            "/api/v1/cache/:cache/multipart-nar/:id/abort",
            post(abort_multipart_nar),
        )
}

fn find_cache(node: &NodeState, name: &str) -> ServerResult<Arc<CacheState>> {
    node.cache_by_name(name).ok_or(ServerError::NoSuchCache)
}

fn require_token(cache: &CacheState, headers: &HeaderMap) -> ServerResult<()> {
    if api_authorized(&cache.token, headers) {
        Ok(())
    } else {
        Err(ServerError::Unauthorized)
    }
}

/// Reads a key from the process-wide DHT.
#[instrument(skip_all, fields(key = %key))]
async fn dht_get(
    Extension(node): Extension<Arc<NodeState>>,
    Path(key): Path<String>,
) -> Json<serde_json::Value> {
    let value = node.dht.get(&key).await;
    Json(json!({ "value": value }))
}

#[derive(Debug, Deserialize)]
struct DhtPutRequest {
    key: String,
    value: String,

    #[serde(default)]
    permanent: bool,
}

/// Writes a key to the process-wide DHT.
#[instrument(skip_all)]
async fn dht_put(
    Extension(node): Extension<Arc<NodeState>>,
    Json(request): Json<DhtPutRequest>,
) -> StatusCode {
    if request.permanent {
        node.dht.put_permanent(&request.key, &request.value).await;
    } else {
        node.dht.put(&request.key, &request.value).await;
    }

    StatusCode::OK
}

/// Returns the metadata clients need to use a cache.
#[instrument(skip_all, fields(cache = %cache_name))]
async fn get_cache_config(
    Extension(node): Extension<Arc<NodeState>>,
    Path(cache_name): Path<String>,
    headers: HeaderMap,
) -> ServerResult<Json<serde_json::Value>> {
    let cache = find_cache(&node, &cache_name)?;

    if cache.is_private()
        && !api_authorized(&cache.token, &headers)
        && !binary_cache_authorized(&cache.token, &headers)
    {
        return Err(ServerError::Unauthorized);
    }

    let public_key = cache.public_key().await?;

    Ok(Json(json!({
        "githubUsername": "",
        "isPublic": cache.is_public(),
        "name": cache.name.as_str(),
        "permission": "Read",
        "preferredCompressionMethod": "XZ",
        "publicSigningKeys": [public_key],
        "uri": cache.url,
    })))
}

/// Returns the store hashes the cache does not hold yet.
#[instrument(skip_all, fields(cache = %cache_name))]
async fn get_missing_narinfo(
    Extension(node): Extension<Arc<NodeState>>,
    Path(cache_name): Path<String>,
    headers: HeaderMap,
    Json(hashes): Json<Vec<String>>,
) -> ServerResult<Json<Vec<String>>> {
    let cache = find_cache(&node, &cache_name)?;
    require_token(&cache, &headers)?;

    Ok(Json(cache.missing_store_hashes(hashes).await?))
}

#[derive(Debug, Deserialize)]
struct MultipartQuery {
    compression: String,
}

/// Reserves an upload slot for a new NAR.
#[instrument(skip_all, fields(cache = %cache_name))]
async fn initiate_multipart_nar(
    Extension(node): Extension<Arc<NodeState>>,
    Path(cache_name): Path<String>,
    Query(query): Query<MultipartQuery>,
    headers: HeaderMap,
) -> ServerResult<Json<serde_json::Value>> {
    let cache = find_cache(&node, &cache_name)?;
    require_token(&cache, &headers)?;

    let compression: Compression = query.compression.parse()?;

    let id = Uuid::new_v4().to_string();
    let file_name = format!("{}.nar.{}", id, compression);

    cache.storage.new_file(&file_name, b"").await?;

    // Publish the reserved name so sibling nodes can route the PUT
    // body to us.
    node.dht.put(&file_name, &cache.id).await;

    tracing::debug!("Reserved upload {} for {}", id, cache.name);

    Ok(Json(json!({
        "narId": id,
        "uploadId": id,
    })))
}

/// Returns the URL the body should be PUT to.
#[instrument(skip_all, fields(cache = %cache_name, id = %id))]
async fn get_upload_url(
    Extension(node): Extension<Arc<NodeState>>,
    Path((cache_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ServerResult<Json<serde_json::Value>> {
    let cache = find_cache(&node, &cache_name)?;
    require_token(&cache, &headers)?;

    Ok(Json(json!({
        "uploadUrl": format!("{}/{}", cache.url, id),
    })))
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    #[serde(rename = "narInfoCreate")]
    nar_info_create: NarInfoCreate,
}

#[derive(Debug, Deserialize)]
struct NarInfoCreate {
    #[serde(rename = "cStoreHash")]
    store_hash: String,

    #[serde(rename = "cStoreSuffix")]
    store_suffix: String,

    #[serde(rename = "cFileHash")]
    file_hash: String,

    #[serde(rename = "cFileSize")]
    file_size: i64,

    #[serde(rename = "cNarHash")]
    nar_hash: String,

    #[serde(rename = "cNarSize")]
    nar_size: i64,

    #[serde(rename = "cDeriver")]
    deriver: String,

    #[serde(rename = "cReferences")]
    references: Vec<String>,
}

/// Promotes a finished upload into a store path.
///
/// The reserved file is renamed to its content-addressed name and the
/// record is inserted. Completing the same upload twice fails with 400
/// because the reserved file no longer exists.
#[instrument(skip_all, fields(cache = %cache_name, id = %id))]
async fn complete_multipart_nar(
    Extension(node): Extension<Arc<NodeState>>,
    Path((cache_name, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<CompleteRequest>,
) -> ServerResult<Response> {
    let cache = find_cache(&node, &cache_name)?;
    require_token(&cache, &headers)?;

    let (file_name, backend) = cache
        .storage
        .find(&id)
        .await?
        .ok_or(ServerError::NoSuchUpload)?;

    let info = request.nar_info_create;
    let compression = Compression::from_file_name(&file_name)?;
    let new_name = format!("{}.nar.{}", info.file_hash, compression);

    // The artifact may already be present under its content-addressed
    // name; the existing copy wins and the reserved file is dropped.
    let existing = cache
        .database
        .find_store_path(
            &[backend.id().to_string()],
            StorePathQuery::FileHash(&info.file_hash),
        )
        .await?;

    if existing.is_some() || backend.find(&new_name, true).await?.is_some() {
        tracing::debug!("Upload {} deduplicated against {}", id, new_name);
        backend.remove(&file_name).await?;
        return Ok(StatusCode::OK.into_response());
    }

    // The rename retires the reserved name; from here on a repeated
    // complete of the same id fails its find.
    backend.rename(&file_name, &new_name).await?;

    cache
        .database
        .insert_store_path(store_path::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            store_hash: Set(info.store_hash.clone()),
            store_suffix: Set(info.store_suffix),
            file_hash: Set(info.file_hash),
            file_size: Set(info.file_size),
            nar_hash: Set(info.nar_hash),
            nar_size: Set(info.nar_size),
            deriver: Set(info.deriver),
            refs: Set(info.references.join(" ")),
            storage_id: Set(backend.id().to_string()),
        })
        .await?;

    if cache.is_public() {
        node.dht.put(&info.store_hash, &cache.id).await;
    }

    Ok(StatusCode::OK.into_response())
}

/// Drops a reserved upload without writing a record.
#[instrument(skip_all, fields(cache = %cache_name, id = %id))]
async fn abort_multipart_nar(
    Extension(node): Extension<Arc<NodeState>>,
    Path((cache_name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ServerResult<StatusCode> {
    let cache = find_cache(&node, &cache_name)?;
    require_token(&cache, &headers)?;

    let (file_name, backend) = cache
        .storage
        .find(&id)
        .await?
        .ok_or(ServerError::NoSuchUpload)?;

    backend.remove(&file_name).await?;

    Ok(StatusCode::OK)
}
