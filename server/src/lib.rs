#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod access;
pub mod advertise;
mod api;
pub mod config;
pub mod database;
pub mod dht;
pub mod error;
pub mod gc;
pub mod metrics;
pub mod narinfo;
pub mod provision;
pub mod remote;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::{extract::Extension, Router};
use chrono::Utc;
use futures::future::join_all;
use sea_orm::{Database, DatabaseConnection};
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use config::{CacheAccess, Config};
use database::entity::cache::CacheModel;
use database::migration::{Migrator, MigratorTrait};
use database::NarpoolDatabase;
use dht::Dht;
use error::{ServerError, ServerResult};
use metrics::CacheMetrics;
use narinfo::{Compression, NarInfo};
use narpool::cache::CacheName;
use narpool::signing::NixKeypair;
use remote::RemoteCacheHelper;
use storage::StorageSet;

/// Node-wide state shared by every server and background worker.
pub struct NodeState {
    pub hostname: String,
    pub database: DatabaseConnection,
    pub dht: Dht,
    pub caches: Vec<Arc<CacheState>>,
}

/// Runtime state of one hosted cache.
pub struct CacheState {
    pub id: String,
    pub name: CacheName,
    pub url: String,
    pub token: String,
    pub access: CacheAccess,
    pub port: u16,
    pub retention: i64,
    pub hostname: String,
    pub storage: StorageSet,
    pub metrics: CacheMetrics,
    pub remote: RemoteCacheHelper,
    pub dht: Dht,
    pub database: DatabaseConnection,
}

impl NodeState {
    /// Loads every cache in the database into runtime state.
    pub async fn open(
        database: DatabaseConnection,
        dht: Dht,
        hostname: String,
    ) -> ServerResult<Arc<Self>> {
        let mut caches = Vec::new();

        for model in database.list_caches().await? {
            caches.push(CacheState::open(database.clone(), dht.clone(), &hostname, &model).await?);
        }

        Ok(Arc::new(Self {
            hostname,
            database,
            dht,
            caches,
        }))
    }

    pub fn cache_by_name(&self, name: &str) -> Option<Arc<CacheState>> {
        self.caches
            .iter()
            .find(|cache| cache.name.as_str() == name)
            .cloned()
    }
}

impl CacheState {
    /// Builds the runtime state of a cache from its descriptor.
    ///
    /// Back-ends are instantiated (and credentials verified), and key
    /// material is generated on first start.
    pub async fn open(
        database: DatabaseConnection,
        dht: Dht,
        hostname: &str,
        model: &CacheModel,
    ) -> ServerResult<Arc<Self>> {
        let storage = StorageSet::open(database.clone(), model).await?;
        let remote = RemoteCacheHelper::new(dht.clone())?;

        let state = Self {
            id: model.id.clone(),
            name: CacheName::new(model.name.clone())?,
            url: model.url.clone(),
            token: model.token.clone(),
            access: model.access(),
            port: model.port as u16,
            retention: model.retention,
            hostname: hostname.to_string(),
            storage,
            metrics: CacheMetrics::new(),
            remote,
            dht,
            database,
        };

        state.ensure_keys().await?;

        Ok(Arc::new(state))
    }

    pub fn is_private(&self) -> bool {
        self.access == CacheAccess::Private
    }

    pub fn is_public(&self) -> bool {
        !self.is_private()
    }

    /// Name of the cache's signing key.
    pub fn key_name(&self) -> String {
        format!("{}.{}-1", self.name.as_str(), self.hostname)
    }

    /// Reads the signing keypair from storage.
    ///
    /// The key is read on demand for every signature and never cached
    /// in memory.
    pub async fn keypair(&self) -> ServerResult<NixKeypair> {
        let raw = storage_string(self.storage.read("key.priv").await?)?;
        Ok(NixKeypair::from_str(raw.trim())?)
    }

    /// Reads the public signing key from storage.
    pub async fn public_key(&self) -> ServerResult<String> {
        let raw = storage_string(self.storage.read("key.pub").await?)?;
        Ok(raw.trim().to_string())
    }

    /// Generates key material on first start; replicates it to
    /// back-ends that are missing it.
    async fn ensure_keys(&self) -> ServerResult<()> {
        if let Some((_, holder)) = self.storage.find("key.priv").await? {
            let private = holder.read("key.priv").await?;
            let public = holder.read("key.pub").await?;

            for backend in self.storage.backends() {
                if backend.find("key.priv", true).await?.is_none() {
                    backend.new_file("key.priv", &private).await?;
                    backend.new_file("key.pub", &public).await?;
                }
            }

            return Ok(());
        }

        let keypair = NixKeypair::generate(&self.key_name())?;
        tracing::info!("Generated signing key {}", self.key_name());

        self.storage
            .new_file_all("key.priv", keypair.export_keypair().as_bytes())
            .await?;
        self.storage
            .new_file_all("key.pub", keypair.export_public_key().as_bytes())
            .await?;

        Ok(())
    }

    /// Builds the unsigned narinfo of an owned store path record.
    pub async fn build_narinfo(
        &self,
        record: &database::entity::store_path::StorePathModel,
    ) -> ServerResult<NarInfo> {
        let (file_name, _) = self
            .storage
            .find(&record.file_hash)
            .await?
            .ok_or(ServerError::NoSuchObject)?;

        let compression = Compression::from_file_name(&file_name)?;

        Ok(NarInfo {
            store_path: format!("/nix/store/{}", record.package_name()),
            url: format!("nar/{}.nar.{}", record.file_hash, compression),
            compression,
            file_hash: Some(format!("sha256:{}", record.file_hash)),
            file_size: Some(record.file_size as u64),
            nar_hash: record.nar_hash.clone(),
            nar_size: record.nar_size as u64,
            deriver: if record.deriver.is_empty() {
                None
            } else {
                Some(record.deriver.clone())
            },
            system: Some("x86_64-linux".to_string()),
            references: record.references(),
            signature: None,
        })
    }

    /// Builds and signs the narinfo of an owned store path record.
    pub async fn get_narinfo(
        &self,
        record: &database::entity::store_path::StorePathModel,
    ) -> ServerResult<NarInfo> {
        let mut narinfo = self.build_narinfo(record).await?;
        narinfo.sign(&self.keypair().await?);
        Ok(narinfo)
    }

    /// Returns the subset of `hashes` this cache does not hold.
    pub async fn missing_store_hashes(&self, hashes: Vec<String>) -> ServerResult<Vec<String>> {
        let owned: std::collections::HashSet<String> = self
            .database
            .list_store_paths(&self.storage.storage_ids())
            .await?
            .into_iter()
            .map(|path| path.store_hash)
            .collect();

        Ok(hashes
            .into_iter()
            .filter(|hash| !owned.contains(hash))
            .collect())
    }
}

fn storage_string(bytes: Vec<u8>) -> ServerResult<String> {
    String::from_utf8(bytes)
        .map_err(|e| ServerError::StorageError(anyhow::anyhow!("invalid UTF-8: {}", e)))
}

/// Builds the HTTP application of one cache.
pub fn cache_app(node: Arc<NodeState>, cache: Arc<CacheState>) -> Router {
    api::binary_cache::get_router()
        .layer(axum::middleware::from_fn(access::apply_cache_auth))
        .layer(Extension(node))
        .layer(Extension(cache))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}

/// Builds the node-level HTTP application.
pub fn node_app(node: Arc<NodeState>) -> Router {
    api::v1::get_router()
        .layer(Extension(node))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}

/// Connects to the database and brings the schema up to date.
pub async fn open_database(config: &Config) -> Result<DatabaseConnection> {
    let url = format!("sqlite://{}?mode=rwc", config.server.database.display());
    let database = Database::connect(&url).await?;
    Migrator::up(&database, None).await?;
    Ok(database)
}

/// Constructs the process-wide DHT handle.
pub fn open_dht(config: &Config, shutdown: CancellationToken) -> Result<Dht> {
    if config.server.standalone {
        tracing::info!("Running standalone, DHT disabled");
        return Ok(Dht::disabled());
    }

    let bootstrap = match (
        &config.server.bootstrap_host,
        config.server.bootstrap_port,
    ) {
        (Some(host), Some(port)) => Some((host.clone(), port)),
        _ => None,
    };

    Dht::spawn(config.server.dht_port, bootstrap, shutdown)
}

/// Runs the node until interrupted.
pub async fn run_server(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();

    let database = open_database(&config).await?;
    provision::apply(&database, &config).await?;

    let dht = open_dht(&config, shutdown.clone())?;
    let node = NodeState::open(database, dht, config.server.hostname.clone()).await?;

    let mut servers = Vec::new();

    for cache in &node.caches {
        let addr = SocketAddr::from(([0, 0, 0, 0], cache.port));
        let server = axum::Server::try_bind(&addr)
            .map_err(|e| anyhow!("Cannot listen on port {}: {}", cache.port, e))?
            .serve(cache_app(node.clone(), cache.clone()).into_make_service())
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());

        tracing::info!("Cache {} listening on {}", cache.name.as_str(), addr);
        servers.push(tokio::spawn(server));

        let _ = tokio::spawn(gc::run_garbage_collection(cache.clone(), shutdown.clone()));
        let _ = tokio::spawn(advertise::run_advertiser(cache.clone(), shutdown.clone()));
    }

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.server.server_port));
    let api_server = axum::Server::try_bind(&api_addr)
        .map_err(|e| anyhow!("Cannot listen on port {}: {}", config.server.server_port, e))?
        .serve(node_app(node.clone()).into_make_service())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tracing::info!("Node API listening on {}", api_addr);
    servers.push(tokio::spawn(api_server));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.cancel();

    for result in join_all(servers).await {
        result??;
    }

    Ok(())
}

/// Runs one garbage collection pass over every cache, then exits.
pub async fn run_garbage_collection_once(config: Config) -> Result<()> {
    let database = open_database(&config).await?;
    provision::apply(&database, &config).await?;

    let node = NodeState::open(database, Dht::disabled(), config.server.hostname.clone()).await?;

    for cache in &node.caches {
        gc::collect_garbage_once(cache, Utc::now()).await?;
    }

    Ok(())
}

/// Runs database migrations, then exits.
pub async fn run_migrations(config: Config) -> Result<()> {
    open_database(&config).await?;
    Ok(())
}
