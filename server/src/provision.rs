//! Declarative provisioning.
//!
//! The YAML configuration is the source of truth for which caches,
//! back-ends, workspaces, and agents exist. On startup it is
//! synchronized into the database: new entries are created (ids and
//! tokens generated), changed fields are updated, and entries that
//! disappeared from the file are removed together with their dependent
//! rows.

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use sea_orm::DatabaseConnection;
use uuid::Uuid;

use crate::config::{CacheConfig, Config, StorageEntry};
use crate::database::entity::{agent, cache, storage, storage_config, store_path, workspace};
use crate::storage::strategy::StrategyState;

/// Length of generated bearer tokens.
const TOKEN_LENGTH: usize = 32;

/// Applies the configuration to the database.
pub async fn apply(database: &DatabaseConnection, config: &Config) -> Result<()> {
    sync_caches(database, config).await?;
    sync_workspaces(database, config).await?;
    sync_agents(database, config).await?;

    Ok(())
}

async fn sync_caches(database: &DatabaseConnection, config: &Config) -> Result<()> {
    let existing = cache::Entity::find().all(database).await?;

    for model in &existing {
        if !config.caches.iter().any(|c| c.name == model.name) {
            tracing::info!("Removing cache {}", model.name);
            remove_cache(database, model).await?;
        }
    }

    for cache_config in &config.caches {
        let model = existing.iter().find(|m| m.name == cache_config.name);

        match model {
            None => create_cache(database, config, cache_config).await?,
            Some(model) => update_cache(database, config, cache_config, model).await?,
        }
    }

    Ok(())
}

async fn create_cache(
    database: &DatabaseConnection,
    config: &Config,
    cache_config: &CacheConfig,
) -> Result<()> {
    let id = Uuid::new_v4().to_string();
    let port = config.cache_port(cache_config);
    let token = generate_token();

    tracing::info!("Creating cache {} on port {}", cache_config.name, port);

    cache::Entity::insert(cache::ActiveModel {
        id: Set(id.clone()),
        name: Set(cache_config.name.clone()),
        url: Set(format!("http://{}:{}", config.server.hostname, port)),
        token: Set(token),
        access: Set(cache_config.access.as_str().to_string()),
        port: Set(port as i32),
        retention: Set(config.cache_retention(cache_config)),
        strategy: Set(config.cache_strategy(cache_config).as_str().to_string()),
        strategy_state: Set(state_json(cache_config, StrategyState::default())?),
    })
    .exec(database)
    .await?;

    for entry in &cache_config.storages {
        create_storage(database, &id, entry).await?;
    }

    Ok(())
}

async fn update_cache(
    database: &DatabaseConnection,
    config: &Config,
    cache_config: &CacheConfig,
    model: &cache::Model,
) -> Result<()> {
    let port = config.cache_port(cache_config);

    cache::Entity::update(cache::ActiveModel {
        id: Set(model.id.clone()),
        url: Set(format!("http://{}:{}", config.server.hostname, port)),
        port: Set(port as i32),
        retention: Set(config.cache_retention(cache_config)),
        access: Set(cache_config.access.as_str().to_string()),
        strategy: Set(config.cache_strategy(cache_config).as_str().to_string()),
        strategy_state: Set(state_json(cache_config, model.strategy_state())?),
        ..Default::default()
    })
    .exec(database)
    .await?;

    let existing = storage::Entity::find()
        .filter(storage::Column::CacheId.eq(&*model.id))
        .all(database)
        .await?;

    for storage_model in &existing {
        if !cache_config
            .storages
            .iter()
            .any(|entry| entry.name == storage_model.name)
        {
            tracing::info!(
                "Removing back-end {} of cache {}",
                storage_model.name,
                model.name
            );
            remove_storage(database, &storage_model.id).await?;
        }
    }

    for entry in &cache_config.storages {
        match existing.iter().find(|m| m.name == entry.name) {
            None => create_storage(database, &model.id, entry).await?,
            Some(storage_model) => {
                storage::Entity::update(storage::ActiveModel {
                    id: Set(storage_model.id.clone()),
                    kind: Set(entry.kind.clone()),
                    root: Set(entry.root.clone()),
                    ..Default::default()
                })
                .exec(database)
                .await?;

                replace_storage_options(database, &storage_model.id, entry).await?;
            }
        }
    }

    Ok(())
}

async fn create_storage(
    database: &DatabaseConnection,
    cache_id: &str,
    entry: &StorageEntry,
) -> Result<()> {
    let id = Uuid::new_v4().to_string();

    storage::Entity::insert(storage::ActiveModel {
        id: Set(id.clone()),
        name: Set(entry.name.clone()),
        kind: Set(entry.kind.clone()),
        root: Set(entry.root.clone()),
        cache_id: Set(cache_id.to_string()),
    })
    .exec(database)
    .await?;

    insert_storage_options(database, &id, entry).await
}

async fn insert_storage_options(
    database: &DatabaseConnection,
    storage_id: &str,
    entry: &StorageEntry,
) -> Result<()> {
    for (key, value) in &entry.options {
        storage_config::Entity::insert(storage_config::ActiveModel {
            storage_id: Set(storage_id.to_string()),
            config_key: Set(key.clone()),
            config_value: Set(value.clone()),
        })
        .exec(database)
        .await?;
    }

    Ok(())
}

async fn replace_storage_options(
    database: &DatabaseConnection,
    storage_id: &str,
    entry: &StorageEntry,
) -> Result<()> {
    storage_config::Entity::delete_many()
        .filter(storage_config::Column::StorageId.eq(storage_id))
        .exec(database)
        .await?;

    insert_storage_options(database, storage_id, entry).await
}

async fn remove_storage(database: &DatabaseConnection, storage_id: &str) -> Result<()> {
    store_path::Entity::delete_many()
        .filter(store_path::Column::StorageId.eq(storage_id))
        .exec(database)
        .await?;

    storage_config::Entity::delete_many()
        .filter(storage_config::Column::StorageId.eq(storage_id))
        .exec(database)
        .await?;

    storage::Entity::delete_by_id(storage_id)
        .exec(database)
        .await?;

    Ok(())
}

async fn remove_cache(database: &DatabaseConnection, model: &cache::Model) -> Result<()> {
    let storages = storage::Entity::find()
        .filter(storage::Column::CacheId.eq(&*model.id))
        .all(database)
        .await?;

    for storage_model in storages {
        remove_storage(database, &storage_model.id).await?;
    }

    cache::Entity::delete_by_id(&*model.id).exec(database).await?;

    Ok(())
}

async fn sync_workspaces(database: &DatabaseConnection, config: &Config) -> Result<()> {
    let existing = workspace::Entity::find().all(database).await?;

    for model in &existing {
        if !config.workspaces.iter().any(|w| w.name == model.name) {
            workspace::Entity::delete_by_id(&*model.id)
                .exec(database)
                .await?;
        }
    }

    for workspace_config in &config.workspaces {
        let cache = cache::Entity::find()
            .filter(cache::Column::Name.eq(&*workspace_config.cache))
            .one(database)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("workspace references unknown cache {}", workspace_config.cache)
            })?;

        match existing.iter().find(|m| m.name == workspace_config.name) {
            None => {
                workspace::Entity::insert(workspace::ActiveModel {
                    id: Set(Uuid::new_v4().to_string()),
                    name: Set(workspace_config.name.clone()),
                    token: Set(generate_token()),
                    cache_id: Set(cache.id),
                })
                .exec(database)
                .await?;
            }
            Some(model) if model.cache_id != cache.id => {
                workspace::Entity::update(workspace::ActiveModel {
                    id: Set(model.id.clone()),
                    cache_id: Set(cache.id),
                    ..Default::default()
                })
                .exec(database)
                .await?;
            }
            Some(_) => {}
        }
    }

    Ok(())
}

async fn sync_agents(database: &DatabaseConnection, config: &Config) -> Result<()> {
    let existing = agent::Entity::find().all(database).await?;

    for model in &existing {
        if !config.agents.iter().any(|a| a.name == model.name) {
            agent::Entity::delete_by_id(&*model.id)
                .exec(database)
                .await?;
        }
    }

    for agent_config in &config.agents {
        let workspace = workspace::Entity::find()
            .filter(workspace::Column::Name.eq(&*agent_config.workspace))
            .one(database)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "agent references unknown workspace {}",
                    agent_config.workspace
                )
            })?;

        match existing.iter().find(|m| m.name == agent_config.name) {
            None => {
                agent::Entity::insert(agent::ActiveModel {
                    id: Set(Uuid::new_v4().to_string()),
                    name: Set(agent_config.name.clone()),
                    token: Set(generate_token()),
                    workspace_id: Set(workspace.id),
                })
                .exec(database)
                .await?;
            }
            Some(model) if model.workspace_id != workspace.id => {
                agent::Entity::update(agent::ActiveModel {
                    id: Set(model.id.clone()),
                    workspace_id: Set(workspace.id),
                    ..Default::default()
                })
                .exec(database)
                .await?;
            }
            Some(_) => {}
        }
    }

    Ok(())
}

fn state_json(cache_config: &CacheConfig, previous: StrategyState) -> Result<String> {
    let mut state = previous;
    state.split = cache_config
        .storages
        .iter()
        .filter_map(|entry| entry.split)
        .collect();

    Ok(serde_json::to_string(&state)?)
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}
