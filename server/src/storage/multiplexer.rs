//! Storage multiplexing.
//!
//! A [`StorageSet`] groups the back-ends of one cache. Writes go through
//! the cache's placement strategy; reads probe the back-ends in list
//! order and the first hit wins. The strategy's mutable state is
//! persisted into the cache descriptor after every selection, best
//! effort.

use std::sync::{Arc, Mutex};

use sea_orm::DatabaseConnection;

use super::strategy::{BackendUsage, Strategy, StrategyError, StrategyState};
use super::{make_backend, StorageBackend};
use crate::database::entity::cache::CacheModel;
use crate::database::NarpoolDatabase;
use crate::error::{ServerError, ServerResult};

pub struct StorageSet {
    cache_id: String,
    backends: Vec<Arc<dyn StorageBackend>>,
    strategy: Strategy,
    state: Mutex<StrategyState>,
    database: DatabaseConnection,
}

impl std::fmt::Debug for StorageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StorageSet")
            .field("cache_id", &self.cache_id)
            .field("strategy", &self.strategy)
            .field("backends", &self.backends.len())
            .finish()
    }
}

impl StorageSet {
    /// Instantiates the back-ends of a cache from its descriptor.
    pub async fn open(database: DatabaseConnection, cache: &CacheModel) -> ServerResult<Self> {
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();

        for storage in database.list_cache_storages(&cache.id).await? {
            let options = database.get_storage_options(&storage.id).await?;
            backends.push(Arc::from(make_backend(&storage, &options).await?));
        }

        if backends.is_empty() {
            return Err(ServerError::ConfigError(anyhow::anyhow!(
                "cache {} has no storage back-ends",
                cache.name
            )));
        }

        let strategy = cache.strategy();
        let state = cache.strategy_state();

        if strategy == Strategy::Split {
            if state.split.len() != backends.len() || state.split.iter().sum::<u64>() != 100 {
                return Err(ServerError::ConfigError(anyhow::anyhow!(
                    "cache {}: split percentages must cover every back-end and sum to 100",
                    cache.name
                )));
            }
        }

        Ok(Self {
            cache_id: cache.id.clone(),
            backends,
            strategy,
            state: Mutex::new(state),
            database,
        })
    }

    pub fn backends(&self) -> &[Arc<dyn StorageBackend>] {
        &self.backends
    }

    pub fn storage_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id().to_string()).collect()
    }

    pub fn backend_by_id(&self, id: &str) -> Option<Arc<dyn StorageBackend>> {
        self.backends.iter().find(|b| b.id() == id).cloned()
    }

    /// Picks the back-end that receives the next write.
    pub async fn choose(&self) -> ServerResult<Arc<dyn StorageBackend>> {
        if self.backends.len() == 1 {
            let backend = &self.backends[0];
            if backend.is_full().await? {
                return Err(ServerError::StorageFull);
            }
            return Ok(backend.clone());
        }

        let mut usages = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            usages.push(BackendUsage {
                used: backend.used_space().await?,
                available: backend.available_space().await?,
                full: backend.is_full().await?,
            });
        }

        let (index, state) = {
            let mut state = self.state.lock().unwrap();
            let index = self.strategy.pick(&usages, &mut state).map_err(|e| match e {
                StrategyError::AllFull => ServerError::StorageFull,
                StrategyError::IncompleteSplit => ServerError::ConfigError(e.into()),
            })?;
            (index, state.clone())
        };

        if let Err(e) = self
            .database
            .update_strategy_state(&self.cache_id, self.strategy, &state)
            .await
        {
            tracing::warn!("Failed to persist strategy state: {}", e);
        }

        Ok(self.backends[index].clone())
    }

    /// Creates a file on the back-end picked by the strategy.
    pub async fn new_file(&self, name: &str, data: &[u8]) -> ServerResult<()> {
        self.choose().await?.new_file(name, data).await
    }

    /// Creates a file on every back-end, used for key material.
    pub async fn new_file_all(&self, name: &str, data: &[u8]) -> ServerResult<()> {
        for backend in &self.backends {
            backend.new_file(name, data).await?;
        }
        Ok(())
    }

    /// Finds the first back-end holding a file whose name contains the
    /// needle, in list order.
    pub async fn find(
        &self,
        needle: &str,
    ) -> ServerResult<Option<(String, Arc<dyn StorageBackend>)>> {
        for backend in &self.backends {
            if let Some(name) = backend.find(needle, false).await? {
                return Ok(Some((name, backend.clone())));
            }
        }

        Ok(None)
    }

    /// Reads a file from whichever back-end holds it.
    pub async fn read(&self, name: &str) -> ServerResult<Vec<u8>> {
        for backend in &self.backends {
            if backend.find(name, true).await?.is_some() {
                return backend.read(name).await;
            }
        }

        Err(ServerError::NoSuchObject)
    }

    /// Sums the free space of all back-ends.
    pub async fn available_space(&self) -> ServerResult<u64> {
        let mut total: u64 = 0;
        for backend in &self.backends {
            total = total.saturating_add(backend.available_space().await?);
        }
        Ok(total)
    }

    /// Short human-readable summary for the advertised descriptor.
    pub fn summary(&self) -> String {
        self.backends
            .iter()
            .map(|b| format!("{}({})", b.name(), b.kind()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use sea_orm::{ActiveValue::Set, Database, EntityTrait};

    use crate::database::entity::{cache, storage};
    use crate::database::migration::{Migrator, MigratorTrait};
    use crate::storage::LocalBackend;

    async fn scratch_set(
        strategy: Strategy,
        state: StrategyState,
        db_dir: &std::path::Path,
        roots: &[&std::path::Path],
    ) -> StorageSet {
        let url = format!("sqlite://{}?mode=rwc", db_dir.join("test.db").display());
        let database = Database::connect(&url).await.unwrap();
        Migrator::up(&database, None).await.unwrap();

        cache::Entity::insert(cache::ActiveModel {
            id: Set("cache-1".to_string()),
            name: Set("demo".to_string()),
            url: Set("http://localhost:8081".to_string()),
            token: Set("secret".to_string()),
            access: Set("public".to_string()),
            port: Set(8081),
            retention: Set(4),
            strategy: Set(strategy.as_str().to_string()),
            strategy_state: Set(serde_json::to_string(&state).unwrap()),
        })
        .exec(&database)
        .await
        .unwrap();

        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();
        for (i, root) in roots.iter().enumerate() {
            let id = format!("storage-{}", i);

            storage::Entity::insert(storage::ActiveModel {
                id: Set(id.clone()),
                name: Set(format!("backend-{}", i)),
                kind: Set("local".to_string()),
                root: Set(root.display().to_string()),
                cache_id: Set("cache-1".to_string()),
            })
            .exec(&database)
            .await
            .unwrap();

            backends.push(Arc::new(
                LocalBackend::new(id, format!("backend-{}", i), root)
                    .await
                    .unwrap(),
            ));
        }

        StorageSet {
            cache_id: "cache-1".to_string(),
            backends,
            strategy,
            state: Mutex::new(state),
            database,
        }
    }

    #[tokio::test]
    async fn test_find_first_hit_wins() {
        let db_dir = tempfile::tempdir().unwrap();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let set = scratch_set(
            Strategy::InOrder,
            StrategyState::default(),
            db_dir.path(),
            &[dir_a.path(), dir_b.path()],
        )
        .await;

        set.backends()[1].new_file("abc.nar.xz", b"b").await.unwrap();
        set.backends()[0].new_file("abc.nar.xz", b"a").await.unwrap();

        let (name, backend) = set.find("abc").await.unwrap().unwrap();
        assert_eq!("abc.nar.xz", name);
        assert_eq!("storage-0", backend.id());
    }

    #[tokio::test]
    async fn test_round_robin_alternates_and_persists() {
        let db_dir = tempfile::tempdir().unwrap();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let set = scratch_set(
            Strategy::RoundRobin,
            StrategyState::default(),
            db_dir.path(),
            &[dir_a.path(), dir_b.path()],
        )
        .await;

        set.new_file("one", b"x").await.unwrap();
        set.new_file("two", b"x").await.unwrap();

        assert!(set.backends()[0].find("one", true).await.unwrap().is_some());
        assert!(set.backends()[1].find("two", true).await.unwrap().is_some());

        let persisted = cache::Entity::find_by_id("cache-1")
            .one(&set.database)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(2, persisted.strategy_state().index);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_backend() {
        let db_dir = tempfile::tempdir().unwrap();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let set = scratch_set(
            Strategy::InOrder,
            StrategyState::default(),
            db_dir.path(),
            &[dir_a.path(), dir_b.path()],
        )
        .await;

        set.new_file_all("key.pub", b"demo:abc").await.unwrap();

        for backend in set.backends() {
            assert_eq!(b"demo:abc".to_vec(), backend.read("key.pub").await.unwrap());
        }
    }
}
