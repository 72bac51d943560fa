//! S3 storage.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Builder as S3ConfigBuilder, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, TimeZone, Utc};

use super::StorageBackend;
use crate::error::{ServerError, ServerResult};

/// A back-end stored in an S3-compatible bucket.
///
/// The cache's `root` becomes a key prefix inside the bucket so several
/// back-ends can share one bucket.
#[derive(Debug)]
pub struct S3Backend {
    id: String,
    name: String,
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    /// Connects to the bucket and verifies the credentials.
    ///
    /// Invalid credentials or an unreachable bucket fail here, not on
    /// the first artifact request.
    pub async fn new(
        id: String,
        name: String,
        root: &str,
        options: &HashMap<String, String>,
    ) -> ServerResult<Self> {
        let get = |key: &str| {
            options.get(key).cloned().ok_or_else(|| {
                ServerError::ConfigError(anyhow::anyhow!("missing storage option \"{}\"", key))
            })
        };

        let bucket = get("s3_bucket")?;
        let region = get("s3_region")?;
        let access_key = get("s3_access-key")?;
        let secret_key = get("s3_secret-key")?;

        let shared_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let mut builder = S3ConfigBuilder::from(&shared_config)
            .region(Region::new(region))
            .credentials_provider(Credentials::new(access_key, secret_key, None, None, "s3"));

        if let Some(endpoint) = options.get("s3_endpoint") {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .map_err(|e| {
                ServerError::StorageError(anyhow::anyhow!(
                    "Cannot access bucket {}: {}",
                    bucket,
                    e
                ))
            })?;

        Ok(Self {
            id,
            name,
            client,
            bucket,
            prefix: root.trim_matches('/').to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            Some(key)
        } else {
            key.strip_prefix(&self.prefix)
                .and_then(|rest| rest.strip_prefix('/'))
        }
    }

    async fn list_objects(&self) -> ServerResult<Vec<(String, u64)>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.key(""));

            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }

            let output = req.send().await.map_err(ServerError::storage_error)?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                let Some(stripped) = self.strip_prefix(key) else {
                    continue;
                };

                if !stripped.is_empty() {
                    objects.push((
                        stripped.to_string(),
                        object.size().unwrap_or_default() as u64,
                    ));
                }
            }

            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn put(&self, name: &str, data: &[u8]) -> ServerResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn new_file(&self, name: &str, data: &[u8]) -> ServerResult<()> {
        self.put(name, data).await
    }

    async fn save(&self, name: &str, data: &[u8]) -> ServerResult<()> {
        self.put(name, data).await
    }

    async fn read(&self, name: &str) -> ServerResult<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    ServerError::NoSuchObject
                } else {
                    ServerError::StorageError(anyhow::anyhow!(
                        "Error reading {}: {}",
                        name,
                        service_error
                    ))
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(body.into_bytes().to_vec())
    }

    async fn rename(&self, name: &str, new_name: &str) -> ServerResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, self.key(name)))
            .key(self.key(new_name))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }

    async fn remove(&self, name: &str) -> ServerResult<()> {
        // DeleteObject is idempotent on S3; probe first so a missing
        // object surfaces like on the other back-ends.
        self.file_created_at(name).await?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(())
    }

    async fn list(&self) -> ServerResult<Vec<String>> {
        Ok(self
            .list_objects()
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn find(&self, needle: &str, strict: bool) -> ServerResult<Option<String>> {
        for name in self.list().await? {
            if (strict && name == needle) || (!strict && name.contains(needle)) {
                return Ok(Some(name));
            }
        }

        Ok(None)
    }

    async fn file_created_at(&self, name: &str) -> ServerResult<DateTime<Utc>> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    ServerError::NoSuchObject
                } else {
                    ServerError::StorageError(anyhow::anyhow!(
                        "Error inspecting {}: {}",
                        name,
                        service_error
                    ))
                }
            })?;

        let modified = output.last_modified().ok_or_else(|| {
            ServerError::StorageError(anyhow::anyhow!("{} has no modification time", name))
        })?;

        Utc.timestamp_opt(modified.secs(), modified.subsec_nanos())
            .single()
            .ok_or_else(|| {
                ServerError::StorageError(anyhow::anyhow!(
                    "{} has an out-of-range modification time",
                    name
                ))
            })
    }

    async fn available_space(&self) -> ServerResult<u64> {
        // Object storage does not expose capacity; treat it as unbounded
        // so the fullness predicate never trips.
        Ok(u64::MAX)
    }

    async fn used_space(&self) -> ServerResult<u64> {
        Ok(self
            .list_objects()
            .await?
            .into_iter()
            .map(|(_, size)| size)
            .sum())
    }
}
