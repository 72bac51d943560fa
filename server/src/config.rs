//! Server configuration.
//!
//! The node is configured with a single YAML document describing the
//! server itself and the set of caches it hosts. The configuration is
//! declarative: on startup it is validated as a whole, then synchronized
//! into the database (see `provision`). A configuration that fails
//! validation aborts startup before any subsystem boots.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::storage::strategy::Strategy;

/// Storage types known to the back-end factory.
pub const STORAGE_TYPES: &[&str] = &["local", "s3"];

/// Configuration keys required by the S3 back-end.
pub const S3_REQUIRED_KEYS: &[&str] = &["s3_bucket", "s3_region", "s3_access-key", "s3_secret-key"];

/// Configuration for a narpool node.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Node-wide settings.
    pub server: ServerConfig,

    /// Caches hosted by this node.
    #[serde(default)]
    pub caches: Vec<CacheConfig>,

    /// Workspaces (deployment grouping; persisted and validated only).
    #[serde(default)]
    pub workspaces: Vec<WorkspaceConfig>,

    /// Agents (deployment endpoints; persisted and validated only).
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Node-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    pub database: PathBuf,

    /// Hostname other peers can reach this node under.
    ///
    /// Also part of the signing key name (`{cache}.{hostname}-1`).
    pub hostname: String,

    /// Whether to run without joining the DHT overlay.
    ///
    /// In standalone mode all DHT operations are no-ops and the node
    /// never learns about peer caches.
    #[serde(default)]
    pub standalone: bool,

    /// Port the DHT overlay listens on.
    #[serde(rename = "dht-port", default = "default_dht_port")]
    pub dht_port: u16,

    /// Host of an existing overlay node to bootstrap from.
    #[serde(rename = "bootstrap-host", default)]
    pub bootstrap_host: Option<String>,

    /// DHT port of the bootstrap node.
    #[serde(rename = "bootstrap-port", default)]
    pub bootstrap_port: Option<u16>,

    /// Port of the node-level HTTP API.
    #[serde(rename = "server-port", default = "default_server_port")]
    pub server_port: u16,

    /// Port reserved for the deployment subsystem.
    ///
    /// Accepted for compatibility; nothing is served on it.
    #[serde(rename = "deploy-port", default = "default_deploy_port")]
    pub deploy_port: u16,

    /// Secret used when minting workspace and agent tokens.
    ///
    /// Cache tokens are opaque shared secrets, so this only needs to be
    /// set when the deployment subsystem is in use.
    #[serde(default)]
    pub key: Option<String>,

    /// Defaults applied to caches that omit the corresponding field.
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// Per-cache defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Retention in days. -1 disables retention.
    #[serde(default = "default_retention")]
    pub retention: i64,

    /// Port of the first cache; subsequent caches must set their own.
    #[serde(default = "default_cache_port")]
    pub port: u16,

    /// Storage back-end type.
    #[serde(default = "default_storage_type")]
    pub storage: String,

    /// Placement strategy.
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
}

/// One hosted cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Unique name of the cache.
    pub name: String,

    /// Port the cache's binary cache API listens on.
    #[serde(default)]
    pub port: Option<u16>,

    /// Retention in days. -1 disables retention.
    #[serde(default)]
    pub retention: Option<i64>,

    /// Whether anonymous clients may pull from the cache.
    #[serde(default)]
    pub access: CacheAccess,

    /// Placement strategy across the cache's back-ends.
    #[serde(rename = "storage-strategy", default)]
    pub storage_strategy: Option<Strategy>,

    /// Storage back-ends.
    #[serde(default)]
    pub storages: Vec<StorageEntry>,
}

/// One storage back-end of a cache.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageEntry {
    /// Name, unique within the cache.
    pub name: String,

    /// Back-end type tag (`local` or `s3`).
    #[serde(rename = "type")]
    pub kind: String,

    /// Root directory (local) or key prefix (object storage).
    pub root: String,

    /// Target share of occupied bytes, for the `split` strategy.
    #[serde(default)]
    pub split: Option<u64>,

    /// Type-prefixed options (e.g. `s3_bucket`, `s3_region`).
    #[serde(flatten)]
    pub options: HashMap<String, String>,
}

/// A workspace entry. Validated and persisted, not served.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    pub name: String,
    pub cache: String,
}

/// An agent entry. Validated and persisted, not served.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub name: String,
    pub workspace: String,
}

/// Cache access level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheAccess {
    /// Anyone may pull; narinfo/NAR requests need no credentials.
    #[default]
    Public,

    /// Every request must present the cache's bearer token.
    Private,
}

impl CacheAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

impl FromStr for CacheAccess {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            _ => Err(anyhow!("unknown access level \"{}\"", s)),
        }
    }
}

impl fmt::Display for CacheAccess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Config {
    /// Returns the effective port of a cache.
    pub fn cache_port(&self, cache: &CacheConfig) -> u16 {
        cache.port.unwrap_or(self.server.defaults.port)
    }

    /// Returns the effective retention of a cache, in days.
    pub fn cache_retention(&self, cache: &CacheConfig) -> i64 {
        cache.retention.unwrap_or(self.server.defaults.retention)
    }

    /// Returns the effective placement strategy of a cache.
    pub fn cache_strategy(&self, cache: &CacheConfig) -> Strategy {
        cache
            .storage_strategy
            .unwrap_or(self.server.defaults.strategy)
    }

    /// Validates the configuration as a whole.
    ///
    /// All violations are collected so the operator sees every problem
    /// at once rather than fixing them one restart at a time.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        self.validate_caches(&mut errors);
        self.validate_workspaces(&mut errors);
        self.validate_agents(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_caches(&self, errors: &mut Vec<String>) {
        let mut names = HashSet::new();
        let mut ports = HashSet::new();

        ports.insert(self.server.server_port);
        ports.insert(self.server.deploy_port);
        if !self.server.standalone {
            ports.insert(self.server.dht_port);
        }

        for cache in &self.caches {
            let name = &cache.name;

            if !names.insert(name.clone()) {
                errors.push(format!("Duplicate cache name: {}", name));
            }

            if narpool::cache::CacheName::new(name.clone()).is_err() {
                errors.push(format!("Cache '{}': invalid cache name", name));
            }

            let port = self.cache_port(cache);
            if port == 0 {
                errors.push(format!("Cache '{}': port must be between 1 and 65535", name));
            } else if !ports.insert(port) {
                errors.push(format!("Cache '{}': port {} already in use", name, port));
            }

            if self.cache_retention(cache) < -1 {
                errors.push(format!(
                    "Cache '{}': retention must be a number of days, or -1",
                    name
                ));
            }

            if cache.storages.is_empty() {
                errors.push(format!("Cache '{}': at least one storage is required", name));
            }

            self.validate_storages(cache, errors);
        }
    }

    fn validate_storages(&self, cache: &CacheConfig, errors: &mut Vec<String>) {
        let mut names = HashSet::new();

        for storage in &cache.storages {
            if !names.insert(storage.name.clone()) {
                errors.push(format!(
                    "Cache '{}': Duplicate storage name: {}",
                    cache.name, storage.name
                ));
            }

            if !STORAGE_TYPES.contains(&storage.kind.as_str()) {
                errors.push(format!(
                    "Cache '{}': Storage '{}' has unknown type '{}'. Supported types: {}",
                    cache.name,
                    storage.name,
                    storage.kind,
                    STORAGE_TYPES.join(", ")
                ));
                continue;
            }

            if storage.kind == "s3" {
                for key in S3_REQUIRED_KEYS {
                    if !storage.options.contains_key(*key) {
                        errors.push(format!(
                            "Cache '{}': Storage '{}' is missing required configuration '{}'",
                            cache.name, storage.name, key
                        ));
                    }
                }
            }
        }

        if self.cache_strategy(cache) == Strategy::Split {
            let mut sum = 0u64;
            let mut complete = true;

            for storage in &cache.storages {
                match storage.split {
                    Some(split) => sum += split,
                    None => {
                        complete = false;
                        errors.push(format!(
                            "Cache '{}': Storage '{}' is missing its split percentage",
                            cache.name, storage.name
                        ));
                    }
                }
            }

            if complete && sum != 100 {
                errors.push(format!(
                    "Cache '{}': split percentages sum to {}, expected 100",
                    cache.name, sum
                ));
            }
        }
    }

    fn validate_workspaces(&self, errors: &mut Vec<String>) {
        let cache_names: HashSet<_> = self.caches.iter().map(|c| c.name.as_str()).collect();
        let mut names = HashSet::new();

        for workspace in &self.workspaces {
            if !names.insert(workspace.name.as_str()) {
                errors.push(format!("Duplicate workspace name: {}", workspace.name));
            }

            if !cache_names.contains(workspace.cache.as_str()) {
                errors.push(format!(
                    "Workspace '{}' references unknown cache: {}",
                    workspace.name, workspace.cache
                ));
            }
        }
    }

    fn validate_agents(&self, errors: &mut Vec<String>) {
        let workspace_names: HashSet<_> =
            self.workspaces.iter().map(|w| w.name.as_str()).collect();
        let mut names = HashSet::new();

        for agent in &self.agents {
            if !names.insert(agent.name.as_str()) {
                errors.push(format!("Duplicate agent name: {}", agent.name));
            }

            if !workspace_names.contains(agent.workspace.as_str()) {
                errors.push(format!(
                    "Agent '{}' references unknown workspace: {}",
                    agent.name, agent.workspace
                ));
            }
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            port: default_cache_port(),
            storage: default_storage_type(),
            strategy: default_strategy(),
        }
    }
}

fn default_dht_port() -> u16 {
    4222
}

fn default_server_port() -> u16 {
    5000
}

fn default_deploy_port() -> u16 {
    5001
}

fn default_retention() -> i64 {
    4
}

fn default_cache_port() -> u16 {
    8080
}

fn default_storage_type() -> String {
    "local".to_string()
}

fn default_strategy() -> Strategy {
    Strategy::InOrder
}

/// Loads and validates a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Error reading configuration {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&raw)?;

    if let Err(errors) = config.validate() {
        return Err(anyhow!(
            "Invalid configuration:\n  - {}",
            errors.join("\n  - ")
        ));
    }

    Ok(config)
}
