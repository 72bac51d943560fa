//! Remote cache lookups.
//!
//! When a cache does not hold a requested artifact, it resolves the
//! owner through the DHT, scores the candidate peers, and fetches from
//! the best one. Fetched narinfos are re-signed with the local key so
//! clients only ever need to trust this cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::advertise::CacheDescriptor;
use crate::dht::Dht;
use crate::error::{ServerError, ServerResult};
use crate::narinfo::NarInfo;
use narpool::signing::NixKeypair;

/// Weight of the measured ping latency (milliseconds) in peer scoring.
const LATENCY_WEIGHT: f64 = 0.2;

/// Weight of the advertised load score in peer scoring.
const LOAD_WEIGHT: f64 = 0.8;

/// Bound on every outbound request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RemoteCacheHelper {
    client: reqwest::Client,
    dht: Dht,

    /// Memoized `nar/{file_hash}.nar.{codec}` -> peer base URL, filled
    /// at narinfo time so the NAR request hits the same peer.
    cached_paths: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for RemoteCacheHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RemoteCacheHelper").finish()
    }
}

impl RemoteCacheHelper {
    pub fn new(dht: Dht) -> ServerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ServerError::upstream_error)?;

        Ok(Self {
            client,
            dht,
            cached_paths: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves the best peer holding a store hash, or `None`.
    ///
    /// Candidates come from the DHT owner mappings; every candidate is
    /// pinged and dead ones are skipped. Stale mappings are expected,
    /// which is why the ping is not optional.
    pub async fn best_peer(&self, store_hash: &str) -> Option<String> {
        let cache_ids = self.dht.get(store_hash).await?;

        let mut best: Option<(f64, String)> = None;

        for cache_id in cache_ids {
            let Some(descriptors) = self.dht.get(&cache_id).await else {
                continue;
            };

            // The newest descriptor wins.
            let Some(raw) = descriptors.last() else {
                continue;
            };

            let descriptor: CacheDescriptor = match serde_json::from_str(raw) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::debug!("Ignoring malformed descriptor for {}: {}", cache_id, e);
                    continue;
                }
            };

            let Some(latency_ms) = self.ping(&descriptor.url).await else {
                tracing::debug!("Peer {} did not answer the ping", descriptor.url);
                continue;
            };

            let load_score = descriptor
                .metrics
                .as_ref()
                .map(|m| m.load_score)
                .unwrap_or(0.0);

            let score = latency_ms * LATENCY_WEIGHT + load_score * LOAD_WEIGHT;
            tracing::debug!("Peer {} scored {:.3}", descriptor.url, score);

            if best.as_ref().map_or(true, |(s, _)| score < *s) {
                best = Some((score, descriptor.url));
            }
        }

        best.map(|(_, url)| url)
    }

    /// Pings a peer, returning the latency in milliseconds.
    async fn ping(&self, url: &str) -> Option<f64> {
        let started = Instant::now();

        let response = self
            .client
            .get(format!("{}/nix-cache-info", url))
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        Some(started.elapsed().as_secs_f64() * 1000.0)
    }

    /// Fetches a narinfo from a peer and re-signs it with our key.
    ///
    /// The NAR location is memoized so the follow-up NAR request is
    /// routed to the same peer.
    pub async fn fetch_narinfo(
        &self,
        store_hash: &str,
        peer_url: &str,
        keypair: &NixKeypair,
    ) -> ServerResult<NarInfo> {
        let response = self
            .client
            .get(format!("{}/{}.narinfo", peer_url, store_hash))
            .send()
            .await
            .map_err(ServerError::upstream_error)?;

        if !response.status().is_success() {
            return Err(ServerError::UpstreamError(anyhow::anyhow!(
                "peer returned {} for {}.narinfo",
                response.status(),
                store_hash
            )));
        }

        let body = response.text().await.map_err(ServerError::upstream_error)?;

        let mut narinfo = NarInfo::from_str(&body)?;
        narinfo.sign(keypair);

        self.cached_paths
            .lock()
            .unwrap()
            .insert(narinfo.url.clone(), peer_url.to_string());

        Ok(narinfo)
    }

    /// Returns the peer memoized for a NAR path.
    pub fn peer_for(&self, nar_path: &str) -> Option<String> {
        self.cached_paths.lock().unwrap().get(nar_path).cloned()
    }

    /// Fetches a NAR from a peer, evicting the memoized mapping on
    /// success.
    pub async fn fetch_nar(&self, nar_path: &str, peer_url: &str) -> ServerResult<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/{}", peer_url, nar_path))
            .send()
            .await
            .map_err(ServerError::upstream_error)?;

        if !response.status().is_success() {
            return Err(ServerError::UpstreamError(anyhow::anyhow!(
                "peer returned {} for {}",
                response.status(),
                nar_path
            )));
        }

        let body = response.bytes().await.map_err(ServerError::upstream_error)?;

        self.cached_paths.lock().unwrap().remove(nar_path);

        Ok(body.to_vec())
    }
}
