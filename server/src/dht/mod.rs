//! DHT coordination.
//!
//! Two key spaces share the overlay: `cache_id -> JSON descriptor`
//! (republished by the advertiser) and `store_hash`/`file_name ->
//! cache_id` owner mappings (appended by whoever holds the artifact).
//! Keys are hashed before they hit the overlay; values accumulate per
//! key and `get` returns all of them.
//!
//! The handle is cheap to clone and explicitly passed into every
//! subsystem that needs it. There are three modes:
//!
//! - **disabled** — standalone nodes; every operation is a no-op
//!   returning `None`,
//! - **memory** — a process-local store with the same append semantics,
//!   backing tests and single-machine setups,
//! - **networked** — a process-wide Kademlia runner (see [`runner`]).

pub mod runner;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use runner::Command;

/// Capacity of the runner's command queue.
const COMMAND_BUFFER: usize = 64;

/// A handle to the process-wide DHT.
#[derive(Debug, Clone)]
pub struct Dht {
    inner: DhtInner,
}

#[derive(Debug, Clone)]
enum DhtInner {
    Disabled,
    Memory(Arc<Mutex<HashMap<String, Vec<String>>>>),
    Networked(mpsc::Sender<Command>),
}

impl Dht {
    /// Returns a handle whose operations are all no-ops.
    ///
    /// Used in standalone mode: the node serves its local caches and
    /// never looks for peers.
    pub fn disabled() -> Self {
        Self {
            inner: DhtInner::Disabled,
        }
    }

    /// Returns a handle backed by a process-local store.
    ///
    /// Mappings are only visible within this process; useful for tests
    /// and single-machine multi-cache setups.
    pub fn memory() -> Self {
        Self {
            inner: DhtInner::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Spawns the Kademlia runner and returns a handle to it.
    ///
    /// With a bootstrap address the runner joins the existing overlay;
    /// without one it starts a fresh overlay others can bootstrap from.
    pub fn spawn(
        port: u16,
        bootstrap: Option<(String, u16)>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let runner = runner::build(port, bootstrap)?;
        let _ = tokio::spawn(async move {
            if let Err(e) = runner::run(runner, rx, shutdown).await {
                tracing::error!("DHT runner failed: {}", e);
            }
        });

        Ok(Self {
            inner: DhtInner::Networked(tx),
        })
    }

    /// Stores a value under a key. The value expires unless refreshed.
    pub async fn put(&self, key: &str, value: &str) {
        self.put_inner(key, value, false).await
    }

    /// Stores a value the runner keeps republishing while it lives.
    pub async fn put_permanent(&self, key: &str, value: &str) {
        self.put_inner(key, value, true).await
    }

    async fn put_inner(&self, key: &str, value: &str, permanent: bool) {
        match &self.inner {
            DhtInner::Disabled => {}
            DhtInner::Memory(store) => {
                let mut store = store.lock().unwrap();
                let values = store.entry(key.to_string()).or_default();
                if !values.iter().any(|v| v == value) {
                    values.push(value.to_string());
                }
            }
            DhtInner::Networked(tx) => {
                let command = Command::Put {
                    key: key.to_string(),
                    value: value.to_string(),
                    permanent,
                };

                if tx.send(command).await.is_err() {
                    tracing::warn!("DHT runner is gone, dropping put for {}", key);
                }
            }
        }
    }

    /// Returns all known values under a key, or `None`.
    ///
    /// Order is not guaranteed. `None` is returned both when the key is
    /// unknown and when the DHT is not live.
    pub async fn get(&self, key: &str) -> Option<Vec<String>> {
        match &self.inner {
            DhtInner::Disabled => None,
            DhtInner::Memory(store) => store.lock().unwrap().get(key).cloned(),
            DhtInner::Networked(tx) => {
                let (reply_tx, reply_rx) = oneshot::channel();

                let command = Command::Get {
                    key: key.to_string(),
                    reply: reply_tx,
                };

                if tx.send(command).await.is_err() {
                    return None;
                }

                reply_rx.await.ok().flatten()
            }
        }
    }
}

/// Hashes a textual key into its overlay representation.
pub fn hash_key(key: &str) -> Vec<u8> {
    Sha256::digest(key.as_bytes()).to_vec()
}
