//! Database access.

pub mod entity;
pub mod migration;

use std::collections::HashMap;

use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use sea_orm::DatabaseConnection;

use crate::error::{ServerError, ServerResult};
use crate::storage::strategy::{Strategy, StrategyState};
use entity::cache::{self, CacheModel, Entity as Cache};
use entity::storage::{self, Entity as Storage, StorageModel};
use entity::storage_config::{self, Entity as StorageConfig};
use entity::store_path::{self, Entity as StorePath, StorePathModel};

/// How to look up a store path record.
pub enum StorePathQuery<'a> {
    /// By the hash part of the store path.
    StoreHash(&'a str),

    /// By the hash of the compressed artifact.
    FileHash(&'a str),
}

/// Synchronous metadata queries used by the request engine and the
/// background workers.
#[async_trait]
pub trait NarpoolDatabase: Send + Sync {
    /// Retrieves a binary cache by name.
    async fn find_cache(&self, name: &str) -> ServerResult<CacheModel>;

    /// Retrieves a binary cache by its id.
    async fn find_cache_by_id(&self, id: &str) -> ServerResult<CacheModel>;

    /// Retrieves all binary caches on this node.
    async fn list_caches(&self) -> ServerResult<Vec<CacheModel>>;

    /// Retrieves the back-ends of a cache, in creation order.
    async fn list_cache_storages(&self, cache_id: &str) -> ServerResult<Vec<StorageModel>>;

    /// Retrieves the type-prefixed options of a back-end.
    async fn get_storage_options(
        &self,
        storage_id: &str,
    ) -> ServerResult<HashMap<String, String>>;

    /// Retrieves one store path record held by any of the given back-ends.
    async fn find_store_path(
        &self,
        storage_ids: &[String],
        query: StorePathQuery<'_>,
    ) -> ServerResult<Option<StorePathModel>>;

    /// Retrieves all store path records held by the given back-ends.
    async fn list_store_paths(&self, storage_ids: &[String])
        -> ServerResult<Vec<StorePathModel>>;

    /// Inserts a store path record.
    async fn insert_store_path(&self, model: store_path::ActiveModel) -> ServerResult<()>;

    /// Deletes a store path record.
    async fn delete_store_path(&self, id: &str) -> ServerResult<()>;

    /// Persists the mutable strategy state of a cache.
    async fn update_strategy_state(
        &self,
        cache_id: &str,
        strategy: Strategy,
        state: &StrategyState,
    ) -> ServerResult<()>;
}

#[async_trait]
impl NarpoolDatabase for DatabaseConnection {
    async fn find_cache(&self, name: &str) -> ServerResult<CacheModel> {
        Cache::find()
            .filter(cache::Column::Name.eq(name))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchCache)
    }

    async fn find_cache_by_id(&self, id: &str) -> ServerResult<CacheModel> {
        Cache::find_by_id(id)
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchCache)
    }

    async fn list_caches(&self) -> ServerResult<Vec<CacheModel>> {
        Cache::find()
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn list_cache_storages(&self, cache_id: &str) -> ServerResult<Vec<StorageModel>> {
        Storage::find()
            .filter(storage::Column::CacheId.eq(cache_id))
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn get_storage_options(
        &self,
        storage_id: &str,
    ) -> ServerResult<HashMap<String, String>> {
        let rows = StorageConfig::find()
            .filter(storage_config::Column::StorageId.eq(storage_id))
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.config_key, row.config_value))
            .collect())
    }

    async fn find_store_path(
        &self,
        storage_ids: &[String],
        query: StorePathQuery<'_>,
    ) -> ServerResult<Option<StorePathModel>> {
        let select = StorePath::find().filter(store_path::Column::StorageId.is_in(storage_ids));

        let select = match query {
            StorePathQuery::StoreHash(hash) => {
                select.filter(store_path::Column::StoreHash.eq(hash))
            }
            StorePathQuery::FileHash(hash) => select.filter(store_path::Column::FileHash.eq(hash)),
        };

        select.one(self).await.map_err(ServerError::database_error)
    }

    async fn list_store_paths(
        &self,
        storage_ids: &[String],
    ) -> ServerResult<Vec<StorePathModel>> {
        StorePath::find()
            .filter(store_path::Column::StorageId.is_in(storage_ids))
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn insert_store_path(&self, model: store_path::ActiveModel) -> ServerResult<()> {
        StorePath::insert(model)
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn delete_store_path(&self, id: &str) -> ServerResult<()> {
        StorePath::delete_by_id(id)
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn update_strategy_state(
        &self,
        cache_id: &str,
        strategy: Strategy,
        state: &StrategyState,
    ) -> ServerResult<()> {
        let state_json =
            serde_json::to_string(state).map_err(|e| ServerError::ConfigError(e.into()))?;

        Cache::update(cache::ActiveModel {
            id: Set(cache_id.to_string()),
            strategy: Set(strategy.as_str().to_string()),
            strategy_state: Set(state_json),
            ..Default::default()
        })
        .exec(self)
        .await
        .map_err(ServerError::database_error)?;

        Ok(())
    }
}
