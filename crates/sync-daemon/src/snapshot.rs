//! Store snapshot loading for storeless deployments.
//!
//! A snapshot is a JSON file with `projects`, `branches`, `scenes` and
//! `assets` row arrays, loaded into an [`InMemoryStore`] at startup. Rows use
//! the persisted column names (`project_id`, `type`, ...).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use sync_core::store::{AssetRecord, BranchRecord, InMemoryStore, ProjectRecord, SceneRecord};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub projects: Vec<ProjectRecord>,
    #[serde(default)]
    pub branches: Vec<BranchRecord>,
    #[serde(default)]
    pub scenes: Vec<SceneRecord>,
    #[serde(default)]
    pub assets: Vec<AssetRecord>,
}

/// Load a snapshot file into a fresh in-memory store.
pub fn load_store(path: &Path) -> Result<Arc<InMemoryStore>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read store snapshot {}", path.display()))?;
    let snapshot: StoreSnapshot = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse store snapshot {}", path.display()))?;

    let store = Arc::new(InMemoryStore::new());
    for project in snapshot.projects {
        store.add_project(project);
    }
    for branch in snapshot.branches {
        store.add_branch(branch);
    }
    for scene in snapshot.scenes {
        store.add_scene(scene);
    }
    let asset_count = snapshot.assets.len();
    for asset in snapshot.assets {
        store.add_asset(asset);
    }

    info!(
        "loaded store snapshot from {} ({asset_count} asset row(s))",
        path.display()
    );
    Ok(store)
}
