//! Garbage collection.
//!
//! Retention is age-based, with one twist: an expired store path that
//! is still referenced by a live closure must survive. The collector
//! runs in two phases. Phase one scans every back-end, removes stray
//! files with no record (unless they are in-flight uploads), and sorts
//! recorded paths into a healthy set and an expired queue. Phase two
//! drains the queue, rescuing entries whose package name has become
//! healthy and re-queueing each entry once so late-arriving healthy
//! ancestors get a chance to save it. What is still expired after its
//! second visit is deleted together with its record.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::database::{NarpoolDatabase, StorePathQuery};
use crate::database::entity::store_path::StorePathModel;
use crate::storage::{StorageBackend, RESERVED_PREFIX};
use crate::CacheState;

/// How often garbage collection runs.
pub const GC_INTERVAL: Duration = Duration::from_secs(3600);

struct ExpiredEntry {
    record: StorePathModel,
    backend: Arc<dyn StorageBackend>,
    file: String,
    visited: bool,
}

/// Runs garbage collection periodically until shutdown.
pub async fn run_garbage_collection(cache: Arc<CacheState>, shutdown: CancellationToken) {
    loop {
        // We don't stop even if it errors
        if let Err(e) = collect_garbage_once(&cache, Utc::now()).await {
            tracing::warn!("Garbage collection failed: {}", e);
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = time::sleep(GC_INTERVAL) => {}
        }
    }
}

/// Runs one garbage collection pass.
///
/// `now` is supplied by the caller so retention arithmetic stays
/// deterministic.
#[instrument(skip_all, fields(cache = %cache.name))]
pub async fn collect_garbage_once(cache: &CacheState, now: DateTime<Utc>) -> Result<()> {
    let horizon = if cache.retention < 0 {
        None
    } else {
        Some(now - ChronoDuration::days(cache.retention))
    };

    let mut healthy: HashSet<String> = HashSet::new();
    let mut expired: VecDeque<ExpiredEntry> = VecDeque::new();
    let mut strays = 0u64;

    for backend in cache.storage.backends() {
        for file in backend.list().await? {
            if file.starts_with(RESERVED_PREFIX) {
                continue;
            }

            let file_hash = file
                .split_once(".nar.")
                .map(|(hash, _)| hash)
                .unwrap_or(file.as_str());

            let record = cache
                .database
                .find_store_path(
                    &[backend.id().to_string()],
                    StorePathQuery::FileHash(file_hash),
                )
                .await?;

            match record {
                None => {
                    // No record. Either an upload still in flight, or
                    // debris from an interrupted one.
                    if !backend.is_new_file(&file).await? {
                        tracing::debug!("Removing stray file {}", file);
                        backend.remove(&file).await?;
                        strays += 1;
                    }
                }
                Some(record) => {
                    let created = backend.file_created_at(&file).await?;
                    let fresh = horizon.map_or(true, |horizon| created > horizon);

                    if fresh {
                        healthy.insert(record.package_name());
                        healthy.extend(record.references());
                    } else {
                        expired.push_back(ExpiredEntry {
                            record,
                            backend: backend.clone(),
                            file,
                            visited: false,
                        });
                    }
                }
            }
        }
    }

    let mut removed = 0u64;

    while let Some(mut entry) = expired.pop_front() {
        if healthy.contains(&entry.record.package_name()) {
            // Rescued by a live closure; its own references become
            // live as well.
            for reference in entry.record.references() {
                healthy.insert(reference);
            }
        } else if entry.visited {
            entry.backend.remove(&entry.file).await?;
            cache.database.delete_store_path(&entry.record.id).await?;
            removed += 1;
        } else {
            entry.visited = true;
            expired.push_back(entry);
        }
    }

    tracing::info!(
        "Garbage collection removed {} expired paths and {} stray files",
        removed,
        strays
    );

    Ok(())
}
