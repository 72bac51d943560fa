//! Local file storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::statvfs;
use std::io::ErrorKind as IoErrorKind;
use tokio::fs;

use super::StorageBackend;
use crate::error::{ServerError, ServerResult};

/// A back-end rooted at a local directory.
///
/// The key space is flat: every artifact is a file directly under the
/// root, so `list` and `find` are plain directory scans.
#[derive(Debug)]
pub struct LocalBackend {
    id: String,
    name: String,
    root: PathBuf,
}

impl LocalBackend {
    pub async fn new(id: String, name: String, root: impl AsRef<Path>) -> ServerResult<Self> {
        let root = root.as_ref().to_owned();

        fs::create_dir_all(&root).await.map_err(|e| {
            ServerError::StorageError(anyhow::anyhow!(
                "Failed to create storage directory {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self { id, name, root })
    }

    fn get_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn io_error(&self, name: &str, error: std::io::Error) -> ServerError {
        if error.kind() == IoErrorKind::NotFound {
            ServerError::NoSuchObject
        } else {
            ServerError::StorageError(anyhow::anyhow!(
                "{} in {}: {}",
                name,
                self.root.display(),
                error
            ))
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    async fn new_file(&self, name: &str, data: &[u8]) -> ServerResult<()> {
        fs::write(self.get_path(name), data)
            .await
            .map_err(|e| self.io_error(name, e))
    }

    async fn save(&self, name: &str, data: &[u8]) -> ServerResult<()> {
        fs::write(self.get_path(name), data)
            .await
            .map_err(|e| self.io_error(name, e))
    }

    async fn read(&self, name: &str) -> ServerResult<Vec<u8>> {
        fs::read(self.get_path(name))
            .await
            .map_err(|e| self.io_error(name, e))
    }

    async fn rename(&self, name: &str, new_name: &str) -> ServerResult<()> {
        fs::rename(self.get_path(name), self.get_path(new_name))
            .await
            .map_err(|e| self.io_error(name, e))
    }

    async fn remove(&self, name: &str) -> ServerResult<()> {
        fs::remove_file(self.get_path(name))
            .await
            .map_err(|e| self.io_error(name, e))
    }

    async fn list(&self) -> ServerResult<Vec<String>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| self.io_error(".", e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_error(".", e))? {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }

        Ok(names)
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
        let metadata = fs::metadata(self.get_path(name))
            .await
            .map_err(|e| self.io_error(name, e))?;

        let modified = metadata.modified().map_err(|e| self.io_error(name, e))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    async fn available_space(&self) -> ServerResult<u64> {
        let root = self.root.clone();

        let stat = tokio::task::spawn_blocking(move || statvfs::statvfs(&root))
            .await
            .map_err(|e| ServerError::StorageError(anyhow::anyhow!("statvfs task failed: {}", e)))?
            .map_err(|e| {
                ServerError::StorageError(anyhow::anyhow!(
                    "statvfs on {}: {}",
                    self.root.display(),
                    e
                ))
            })?;

        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    async fn used_space(&self) -> ServerResult<u64> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| self.io_error(".", e))?;

        let mut total = 0u64;
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_error(".", e))? {
            if let Ok(metadata) = entry.metadata().await {
                if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scratch() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("test".to_string(), "main".to_string(), dir.path())
            .await
            .unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_dir, backend) = scratch().await;

        backend.new_file("a.nar.xz", b"\x00\x01\x02").await.unwrap();
        assert_eq!(b"\x00\x01\x02".to_vec(), backend.read("a.nar.xz").await.unwrap());

        backend.save("a.nar.xz", b"\x03").await.unwrap();
        assert_eq!(b"\x03".to_vec(), backend.read("a.nar.xz").await.unwrap());

        backend.rename("a.nar.xz", "b.nar.xz").await.unwrap();
        assert!(matches!(
            backend.read("a.nar.xz").await,
            Err(crate::error::ServerError::NoSuchObject)
        ));

        backend.remove("b.nar.xz").await.unwrap();
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find() {
        let (_dir, backend) = scratch().await;

        backend.new_file("deadbeef.nar.zst", b"").await.unwrap();

        assert_eq!(
            Some("deadbeef.nar.zst".to_string()),
            backend.find("deadbeef", false).await.unwrap()
        );
        assert_eq!(None, backend.find("deadbeef", true).await.unwrap());
        assert_eq!(
            Some("deadbeef.nar.zst".to_string()),
            backend.find("deadbeef.nar.zst", true).await.unwrap()
        );
        assert_eq!(None, backend.find("cafe", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_files_are_new() {
        let (_dir, backend) = scratch().await;

        backend.new_file("upload", b"partial").await.unwrap();
        assert!(backend.is_new_file("upload").await.unwrap());
    }

    #[tokio::test]
    async fn test_used_space_sums_files() {
        let (_dir, backend) = scratch().await;

        backend.new_file("a", &[0u8; 100]).await.unwrap();
        backend.new_file("b", &[0u8; 24]).await.unwrap();

        assert_eq!(124, backend.used_space().await.unwrap());
        assert!(backend.available_space().await.unwrap() > 0);
        assert!(!backend.is_full().await.unwrap());
    }
}
