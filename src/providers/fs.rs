//! Local-directory object storage for development and tests.
//!
//! Keys map to paths under the configured root. "Presigned" URLs are plain
//! `file://` URLs; the TTL is ignored.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use super::ObjectStorage;

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolves a key to a path, rejecting keys that escape the root.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key.trim_start_matches('/'));
        if key.trim().is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid object key: '{}'", key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStorage for FsStorage {
    async fn upload(&self, bytes: &[u8], key: &str, _content_type: &str) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write object {}", path.display()))?;
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Object not found: {}", key))
    }

    async fn presigned_url(&self, key: &str, _ttl: Duration) -> Result<String> {
        let path = self.path_for(key)?;
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        Ok(format!("file://{}", absolute.display()))
    }
}
