//! Persisted-store trait abstraction for project rows.
//!
//! The relational store is an external collaborator: the core only issues
//! bounded row-level queries and single-row writes against it. Implementations:
//! - `InMemoryStore` - for tests and for running the daemon without an
//!   external database (optionally pre-loaded from a JSON snapshot)
//!
//! Every query is bounded; callers never assume unbounded result sets.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A persisted asset row. `data` carries the materialized `path` (ordered
/// ancestor id chain) and `parentId`; `file` is the optional blob descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: i64,
    #[serde(rename = "project_id")]
    pub project_id: i64,
    #[serde(rename = "branch_id")]
    pub branch_id: String,
    #[serde(rename = "owner_id")]
    pub owner_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub file: Option<Value>,
    #[serde(rename = "source_asset_id", default)]
    pub source_asset_id: Option<i64>,
    #[serde(rename = "created_at", default)]
    pub created_at: Option<String>,
}

/// A persisted scene row. Only the columns the synchronization service reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneRecord {
    pub id: i64,
    #[serde(rename = "unique_id", default)]
    pub unique_id: Option<String>,
    #[serde(rename = "project_id")]
    pub project_id: i64,
    #[serde(rename = "branch_id", default)]
    pub branch_id: Option<String>,
    #[serde(rename = "owner_id", default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A project row; only the owner column is consulted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: i64,
    #[serde(rename = "owner_id")]
    pub owner_id: String,
}

/// A branch row. Branch ids are strings (uuid or "local").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord {
    pub id: String,
    #[serde(rename = "project_id")]
    pub project_id: i64,
}

/// Insert payload for a new asset row; the store assigns the id and stamps
/// `created_at`.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub project_id: i64,
    pub branch_id: String,
    pub owner_id: String,
    pub name: String,
    pub asset_type: String,
    pub data: Value,
    pub file: Option<Value>,
    pub source_asset_id: Option<i64>,
}

/// Row-level access to the persisted project store.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// List scene rows, bounded.
    async fn list_scenes(&self, limit: usize) -> Result<Vec<SceneRecord>>;

    /// List asset rows across all projects, bounded.
    async fn list_assets(&self, limit: usize) -> Result<Vec<AssetRecord>>;

    /// Look up a scene by its string unique id.
    async fn scene_by_unique_id(&self, unique_id: &str) -> Result<Option<SceneRecord>>;

    /// Look up a scene by its numeric id.
    async fn scene_by_id(&self, id: i64) -> Result<Option<SceneRecord>>;

    /// Owner of a project, if the project exists.
    async fn project_owner(&self, project_id: i64) -> Result<Option<String>>;

    /// The earliest-created branch of a project.
    async fn earliest_branch(&self, project_id: i64) -> Result<Option<String>>;

    /// Look up a single asset row.
    async fn asset_by_id(&self, id: i64) -> Result<Option<AssetRecord>>;

    /// Load the rows for an explicit id list. Missing ids are skipped.
    async fn assets_by_ids(&self, ids: &[i64]) -> Result<Vec<AssetRecord>>;

    /// All asset rows of one project/branch, bounded.
    async fn assets_in_branch(
        &self,
        project_id: i64,
        branch_id: &str,
        limit: usize,
    ) -> Result<Vec<AssetRecord>>;

    /// Find an asset by project, branch, type and exact name.
    async fn find_asset(
        &self,
        project_id: i64,
        branch_id: &str,
        asset_type: &str,
        name: &str,
    ) -> Result<Option<AssetRecord>>;

    /// Insert a new asset row; returns the stored row with its assigned id.
    async fn insert_asset(&self, asset: NewAsset) -> Result<AssetRecord>;

    /// Replace an asset row's `data` column.
    async fn update_asset_data(&self, id: i64, data: Value) -> Result<()>;

    /// Replace an asset row's `file` column.
    async fn update_asset_file(&self, id: i64, file: Value) -> Result<()>;

    /// Delete a batch of asset rows. Unknown ids are ignored.
    async fn delete_assets(&self, ids: &[i64]) -> Result<()>;
}

#[derive(Default)]
struct StoreInner {
    assets: BTreeMap<i64, AssetRecord>,
    scenes: Vec<SceneRecord>,
    projects: BTreeMap<i64, ProjectRecord>,
    /// Branches in creation order; `earliest_branch` relies on it.
    branches: Vec<BranchRecord>,
    next_asset_id: i64,
}

/// In-memory project store for tests and storeless daemon runs.
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                next_asset_id: 1,
                ..StoreInner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a scene row.
    pub fn add_scene(&self, scene: SceneRecord) {
        self.lock().scenes.push(scene);
    }

    /// Seed a project row.
    pub fn add_project(&self, project: ProjectRecord) {
        self.lock().projects.insert(project.id, project);
    }

    /// Seed a branch row. Creation order is insertion order.
    pub fn add_branch(&self, branch: BranchRecord) {
        self.lock().branches.push(branch);
    }

    /// Seed an asset row with an explicit id, keeping the id sequence ahead
    /// of every seeded row.
    pub fn add_asset(&self, asset: AssetRecord) {
        let mut inner = self.lock();
        inner.next_asset_id = inner.next_asset_id.max(asset.id + 1);
        inner.assets.insert(asset.id, asset);
    }

    /// Number of asset rows currently stored.
    pub fn asset_count(&self) -> usize {
        self.lock().assets.len()
    }
}

#[async_trait]
impl ProjectStore for InMemoryStore {
    async fn list_scenes(&self, limit: usize) -> Result<Vec<SceneRecord>> {
        Ok(self.lock().scenes.iter().take(limit).cloned().collect())
    }

    async fn list_assets(&self, limit: usize) -> Result<Vec<AssetRecord>> {
        Ok(self.lock().assets.values().take(limit).cloned().collect())
    }

    async fn scene_by_unique_id(&self, unique_id: &str) -> Result<Option<SceneRecord>> {
        Ok(self
            .lock()
            .scenes
            .iter()
            .find(|s| s.unique_id.as_deref() == Some(unique_id))
            .cloned())
    }

    async fn scene_by_id(&self, id: i64) -> Result<Option<SceneRecord>> {
        Ok(self.lock().scenes.iter().find(|s| s.id == id).cloned())
    }

    async fn project_owner(&self, project_id: i64) -> Result<Option<String>> {
        Ok(self
            .lock()
            .projects
            .get(&project_id)
            .map(|p| p.owner_id.clone()))
    }

    async fn earliest_branch(&self, project_id: i64) -> Result<Option<String>> {
        Ok(self
            .lock()
            .branches
            .iter()
            .find(|b| b.project_id == project_id)
            .map(|b| b.id.clone()))
    }

    async fn asset_by_id(&self, id: i64) -> Result<Option<AssetRecord>> {
        Ok(self.lock().assets.get(&id).cloned())
    }

    async fn assets_by_ids(&self, ids: &[i64]) -> Result<Vec<AssetRecord>> {
        let inner = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.assets.get(id).cloned())
            .collect())
    }

    async fn assets_in_branch(
        &self,
        project_id: i64,
        branch_id: &str,
        limit: usize,
    ) -> Result<Vec<AssetRecord>> {
        Ok(self
            .lock()
            .assets
            .values()
            .filter(|a| a.project_id == project_id && a.branch_id == branch_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_asset(
        &self,
        project_id: i64,
        branch_id: &str,
        asset_type: &str,
        name: &str,
    ) -> Result<Option<AssetRecord>> {
        Ok(self
            .lock()
            .assets
            .values()
            .find(|a| {
                a.project_id == project_id
                    && a.branch_id == branch_id
                    && a.asset_type == asset_type
                    && a.name == name
            })
            .cloned())
    }

    async fn insert_asset(&self, asset: NewAsset) -> Result<AssetRecord> {
        let mut inner = self.lock();
        let id = inner.next_asset_id;
        inner.next_asset_id += 1;

        let record = AssetRecord {
            id,
            project_id: asset.project_id,
            branch_id: asset.branch_id,
            owner_id: asset.owner_id,
            name: asset.name,
            asset_type: asset.asset_type,
            data: asset.data,
            file: asset.file,
            source_asset_id: asset.source_asset_id,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        inner.assets.insert(id, record.clone());
        Ok(record)
    }

    async fn update_asset_data(&self, id: i64, data: Value) -> Result<()> {
        if let Some(asset) = self.lock().assets.get_mut(&id) {
            asset.data = data;
        }
        Ok(())
    }

    async fn update_asset_file(&self, id: i64, file: Value) -> Result<()> {
        if let Some(asset) = self.lock().assets.get_mut(&id) {
            asset.file = Some(file);
        }
        Ok(())
    }

    async fn delete_assets(&self, ids: &[i64]) -> Result<()> {
        let mut inner = self.lock();
        for id in ids {
            inner.assets.remove(id);
        }
        Ok(())
    }
}
