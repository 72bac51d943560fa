//! Artifact storage.
//!
//! Every cache multiplexes one or more back-ends behind the
//! [`StorageBackend`] trait. Back-ends expose an object-like key space:
//! flat names, whole-body reads and writes, and a couple of metadata
//! queries the garbage collector and the placement strategies rely on.

pub mod local;
pub mod multiplexer;
pub mod s3;
pub mod strategy;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::database::entity::storage::StorageModel;
use crate::error::{ServerError, ServerResult};

pub(crate) use self::local::LocalBackend;
pub(crate) use self::multiplexer::StorageSet;
pub(crate) use self::s3::S3Backend;

/// Ratio of used to available bytes above which a back-end is full.
pub const FULLNESS_THRESHOLD: f64 = 0.95;

/// Seconds within which a file counts as freshly created.
///
/// Files younger than this are considered in-flight uploads and are
/// never garbage collected.
pub const NEW_FILE_AGE: i64 = 3600;

/// Prefix of reserved file names (signing key material).
pub const RESERVED_PREFIX: &str = "key";

/// A storage back-end.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Returns the persisted id of the back-end.
    fn id(&self) -> &str;

    /// Returns the name of the back-end, unique within its cache.
    fn name(&self) -> &str;

    /// Returns the type tag of the back-end.
    fn kind(&self) -> &'static str;

    /// Creates a file, overwriting any previous content.
    async fn new_file(&self, name: &str, data: &[u8]) -> ServerResult<()>;

    /// Writes the whole body of an existing or new file.
    async fn save(&self, name: &str, data: &[u8]) -> ServerResult<()>;

    /// Reads the whole body of a file. Fails if it does not exist.
    async fn read(&self, name: &str) -> ServerResult<Vec<u8>>;

    /// Renames a file within the back-end.
    async fn rename(&self, name: &str, new_name: &str) -> ServerResult<()>;

    /// Removes a file. Missing files surface an error to the caller.
    async fn remove(&self, name: &str) -> ServerResult<()>;

    /// Lists all file names in the back-end.
    async fn list(&self) -> ServerResult<Vec<String>>;

    /// Finds the first file whose name contains (or, with `strict`,
    /// equals) the needle.
    async fn find(&self, needle: &str, strict: bool) -> ServerResult<Option<String>>;

    /// Returns the creation time of a file.
    async fn file_created_at(&self, name: &str) -> ServerResult<DateTime<Utc>>;

    /// Returns the free space of the back-end, in bytes.
    async fn available_space(&self) -> ServerResult<u64>;

    /// Returns the bytes occupied by the back-end's files.
    async fn used_space(&self) -> ServerResult<u64>;

    /// Whether a file was created within the freshness window.
    async fn is_new_file(&self, name: &str) -> ServerResult<bool> {
        let created = self.file_created_at(name).await?;
        Ok((Utc::now() - created).num_seconds() <= NEW_FILE_AGE)
    }

    /// Whether the back-end should not receive further writes.
    async fn is_full(&self) -> ServerResult<bool> {
        let available = self.available_space().await?;
        if available == 0 {
            return Ok(true);
        }

        let used = self.used_space().await?;
        Ok(used as f64 / available as f64 > FULLNESS_THRESHOLD)
    }
}

/// Instantiates a back-end from its persisted descriptor.
pub async fn make_backend(
    storage: &StorageModel,
    options: &HashMap<String, String>,
) -> ServerResult<Box<dyn StorageBackend>> {
    match storage.kind.as_str() {
        "local" => {
            let local = LocalBackend::new(storage.id.clone(), storage.name.clone(), &storage.root)
                .await?;
            Ok(Box::new(local))
        }
        "s3" => {
            let s3 = S3Backend::new(
                storage.id.clone(),
                storage.name.clone(),
                &storage.root,
                options,
            )
            .await?;
            Ok(Box::new(s3))
        }
        other => Err(ServerError::ConfigError(anyhow::anyhow!(
            "unknown storage type \"{}\"",
            other
        ))),
    }
}
