//! Cache advertisement.
//!
//! Every cache periodically publishes its descriptor to the DHT under
//! its id. The descriptor is transient so a dead node decays from the
//! overlay naturally. On startup a cache additionally publishes the
//! owner mapping for every store path it already holds.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::database::NarpoolDatabase;
use crate::error::ServerResult;
use crate::metrics::MetricsSnapshot;
use crate::CacheState;

/// How often the descriptor is republished.
pub const ADVERTISING_INTERVAL: Duration = Duration::from_secs(300);

/// The advertised form of a cache, as stored on the DHT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: String,
    pub access: String,
    pub port: u16,

    #[serde(default)]
    pub metrics: Option<MetricsSnapshot>,

    #[serde(default)]
    pub available_space: u64,

    #[serde(default)]
    pub retention: i64,

    #[serde(default)]
    pub storage: String,
}

/// Publishes the cache descriptor once.
#[instrument(skip_all, fields(cache = %cache.name))]
pub async fn advertise_once(cache: &CacheState) -> ServerResult<()> {
    let descriptor = CacheDescriptor {
        id: cache.id.clone(),
        name: cache.name.as_str().to_string(),
        url: cache.url.clone(),
        token: cache.token.clone(),
        access: cache.access.as_str().to_string(),
        port: cache.port,
        metrics: Some(cache.metrics.snapshot()),
        available_space: cache.storage.available_space().await.unwrap_or(0),
        retention: cache.retention,
        storage: cache.storage.summary(),
    };

    let payload = serde_json::to_string(&descriptor)
        .map_err(|e| crate::error::ServerError::RequestError(e.into()))?;

    cache.dht.put(&cache.id, &payload).await;

    Ok(())
}

/// Publishes `store_hash -> cache_id` for every owned path.
///
/// Only public caches appear in the owner mappings; peers could not
/// fetch from a private cache anyway.
#[instrument(skip_all, fields(cache = %cache.name))]
pub async fn publish_owned_paths(cache: &CacheState) -> ServerResult<()> {
    if cache.is_private() {
        return Ok(());
    }

    let paths = cache
        .database
        .list_store_paths(&cache.storage.storage_ids())
        .await?;

    tracing::debug!("Publishing {} owned store paths", paths.len());

    for path in paths {
        cache.dht.put(&path.store_hash, &cache.id).await;
    }

    Ok(())
}

/// Re-advertises the cache until shutdown.
pub async fn run_advertiser(cache: Arc<CacheState>, shutdown: CancellationToken) {
    if let Err(e) = advertise_once(&cache).await {
        tracing::warn!("Initial advertisement failed: {}", e);
    }

    if let Err(e) = publish_owned_paths(&cache).await {
        tracing::warn!("Publishing owned paths failed: {}", e);
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = time::sleep(ADVERTISING_INTERVAL) => {}
        }

        // We don't stop even if it errors
        if let Err(e) = advertise_once(&cache).await {
            tracing::warn!("Advertisement failed: {}", e);
        }
    }
}
