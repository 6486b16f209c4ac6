//! Object-storage trait abstraction for binary asset payloads.
//!
//! Uploads are keyed by a storage path derived from
//! `projectId/branchId/assetId/filename`. The only caller in this service is
//! the lifecycle manager's default-environment-map bootstrap, which uploads a
//! bundled texture once per project/branch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("upload failed: {0}")]
    Upload(String),
}

pub type Result<T> = std::result::Result<T, ObjectError>;

/// Binary blob storage keyed by storage path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload (or overwrite) an object at the given path.
    async fn upload(&self, path: &str, content: &[u8], content_type: &str) -> Result<()>;

    /// Whether an object exists at the given path.
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// In-memory object store for tests and storeless daemon runs.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(&self, path: &str, content: &[u8], _content_type: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path))
    }
}
