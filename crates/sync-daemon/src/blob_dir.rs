//! Directory-backed object store.
//!
//! Maps storage paths (`projectId/branchId/assetId/filename`) onto files
//! under a root directory, creating intermediate directories as needed.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use sync_core::objects::{ObjectError, ObjectStore, Result};

/// Object store writing blobs to the local filesystem.
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        // Storage paths are relative segments; strip anything that would
        // escape the root.
        let mut resolved = self.root.clone();
        for segment in Path::new(path).components() {
            if let std::path::Component::Normal(segment) = segment {
                resolved.push(segment);
            }
        }
        resolved
    }
}

#[async_trait]
impl ObjectStore for DirObjectStore {
    async fn upload(&self, path: &str, content: &[u8], _content_type: &str) -> Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ObjectError::Upload(e.to_string()))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| ObjectError::Upload(e.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await.unwrap_or(false))
    }
}
