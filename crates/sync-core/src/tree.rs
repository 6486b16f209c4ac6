//! Structural mutations over the persisted asset hierarchy.
//!
//! Assets carry a materialized path (the ordered ancestor id chain) inside
//! their `data` column, redundant with the parent pointer. Move, delete,
//! duplicate and paste rewrite that hierarchy in the store, then move
//! reconciles any live asset documents with a compare-before-write patch.
//!
//! Every operation is a silent no-op when the store is unreachable or the
//! requested rows do not exist; failures are logged, never surfaced to the
//! requesting connection.

use crate::engine::{DocKey, DocumentEngine, PatchOp};
use crate::store::{self, AssetRecord, NewAsset, ProjectStore};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Bound on the per-branch row scan backing subtree queries.
const BRANCH_QUERY_LIMIT: usize = 5000;

/// One live-document path fixup produced by a move, broadcast to clients as
/// part of the `fs:paths:` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathPatch {
    #[serde(rename = "uniqueId")]
    pub unique_id: i64,
    pub path: Vec<i64>,
}

/// Asset-tree mutator: owns handles to the persisted store and the document
/// engine so structural rewrites can be mirrored into live documents.
pub struct AssetTree {
    engine: Arc<DocumentEngine>,
    store: Option<Arc<dyn ProjectStore>>,
}

impl AssetTree {
    pub fn new(engine: Arc<DocumentEngine>, store: Option<Arc<dyn ProjectStore>>) -> Self {
        Self { engine, store }
    }

    /// Move assets (and their subtrees) under a new parent, or to the root
    /// when `to` is `None`. Returns the applied path patches.
    pub async fn move_assets(&self, ids: &[i64], to: Option<i64>) -> Vec<PathPatch> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match self.try_move(store.as_ref(), ids, to).await {
            Ok(patches) => {
                self.patch_live_documents(&patches).await;
                patches
            }
            Err(err) => {
                warn!("asset move failed: {err}");
                Vec::new()
            }
        }
    }

    async fn try_move(
        &self,
        store: &dyn ProjectStore,
        ids: &[i64],
        to: Option<i64>,
    ) -> store::Result<Vec<PathPatch>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let moving_rows = store.assets_by_ids(ids).await?;
        if moving_rows.is_empty() {
            return Ok(Vec::new());
        }

        let project_id = moving_rows[0].project_id;
        let branch_id = moving_rows[0].branch_id.clone();
        let all_rows = store
            .assets_in_branch(project_id, &branch_id, BRANCH_QUERY_LIMIT)
            .await?;

        // Roots are the requested rows whose ancestor chain contains no other
        // requested id; a subtree is never rewritten twice when both a node
        // and one of its descendants are named.
        let moving_set: HashSet<i64> = moving_rows.iter().map(|row| row.id).collect();
        let moving_roots: Vec<&AssetRecord> = moving_rows
            .iter()
            .filter(|row| !asset_path(row).iter().any(|id| moving_set.contains(id)))
            .collect();

        let target_row = to.and_then(|target| all_rows.iter().find(|row| row.id == target));
        let target_path: Vec<i64> = match target_row {
            Some(row) => {
                let mut path = asset_path(row);
                path.push(row.id);
                path
            }
            None => Vec::new(),
        };

        let mut patches = Vec::new();
        for root in moving_roots {
            let mut old_prefix = asset_path(root);
            old_prefix.push(root.id);

            let descendants: Vec<&AssetRecord> = all_rows
                .iter()
                .filter(|row| path_starts_with(&asset_path(row), &old_prefix))
                .collect();

            for row in std::iter::once(root).chain(descendants) {
                let row_path = asset_path(row);
                let next_path = if row.id == root.id {
                    target_path.clone()
                } else {
                    let suffix = if path_starts_with(&row_path, &old_prefix) {
                        &row_path[old_prefix.len()..]
                    } else {
                        &[]
                    };
                    let mut path = target_path.clone();
                    path.push(root.id);
                    path.extend_from_slice(suffix);
                    path
                };

                store
                    .update_asset_data(row.id, data_with_path(&row.data, &next_path))
                    .await?;

                patches.push(PathPatch {
                    unique_id: row.id,
                    path: next_path,
                });
            }
        }

        Ok(patches)
    }

    /// Reconcile live asset documents with freshly computed paths. Both the
    /// top-level `path` and the nested `data.path` are patched, each only
    /// when it differs from the target value.
    async fn patch_live_documents(&self, patches: &[PathPatch]) {
        for patch in patches {
            let key = DocKey::new("assets", patch.unique_id.to_string());
            let Some((_, doc)) = self.engine.fetch(&key).await else {
                continue;
            };

            let next_path = json!(patch.path);
            let current_path = doc.get("path").cloned().unwrap_or_else(|| json!([]));
            let current_data_path = doc
                .get("data")
                .and_then(|data| data.get("path"))
                .cloned()
                .unwrap_or_else(|| json!([]));

            let mut ops = Vec::new();
            if current_path != next_path {
                ops.push(PatchOp::replace(
                    vec![json!("path")],
                    current_path,
                    next_path.clone(),
                ));
            }
            if current_data_path != next_path {
                ops.push(PatchOp::replace(
                    vec![json!("data"), json!("path")],
                    current_data_path,
                    next_path,
                ));
            }

            if !ops.is_empty() {
                self.engine.submit_patch(&key, ops).await;
            }
        }
    }

    /// Delete assets; folder assets take their whole subtree with them.
    /// Returns the flat list of deleted ids. Unknown ids are silent no-ops.
    pub async fn delete_assets(&self, ids: &[i64]) -> Vec<i64> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match self.try_delete(store.as_ref(), ids).await {
            Ok(deleted) => deleted,
            Err(err) => {
                warn!("asset delete failed: {err}");
                Vec::new()
            }
        }
    }

    async fn try_delete(&self, store: &dyn ProjectStore, ids: &[i64]) -> store::Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let roots = store.assets_by_ids(ids).await?;
        if roots.is_empty() {
            return Ok(Vec::new());
        }

        let project_id = roots[0].project_id;
        let branch_id = roots[0].branch_id.clone();
        let all_rows = store
            .assets_in_branch(project_id, &branch_id, BRANCH_QUERY_LIMIT)
            .await?;

        let mut to_delete = BTreeSet::new();
        for root in &roots {
            to_delete.insert(root.id);
            if root.asset_type == "folder" {
                let mut prefix = asset_path(root);
                prefix.push(root.id);
                for row in &all_rows {
                    if path_starts_with(&asset_path(row), &prefix) {
                        to_delete.insert(row.id);
                    }
                }
            }
        }

        let deleted: Vec<i64> = to_delete.into_iter().collect();
        store.delete_assets(&deleted).await?;
        Ok(deleted)
    }

    /// Clone assets next to their originals: each requested row gets a copy
    /// named by the copy counter, and its whole subtree is cloned underneath
    /// with ancestor ids remapped to the fresh clones. Returns every created
    /// row for event broadcast.
    pub async fn duplicate_assets(&self, ids: &[i64]) -> Vec<AssetRecord> {
        self.clone_assets(ids, None).await
    }

    /// Duplicate retargeted to another parent (and possibly another branch).
    pub async fn paste_assets(
        &self,
        ids: &[i64],
        target_branch: &str,
        target_parent: Option<i64>,
    ) -> Vec<AssetRecord> {
        self.clone_assets(ids, Some((target_branch.to_string(), target_parent)))
            .await
    }

    async fn clone_assets(
        &self,
        ids: &[i64],
        retarget: Option<(String, Option<i64>)>,
    ) -> Vec<AssetRecord> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match self.try_clone(store.as_ref(), ids, retarget).await {
            Ok(created) => created,
            Err(err) => {
                warn!("asset duplicate failed: {err}");
                Vec::new()
            }
        }
    }

    async fn try_clone(
        &self,
        store: &dyn ProjectStore,
        ids: &[i64],
        retarget: Option<(String, Option<i64>)>,
    ) -> store::Result<Vec<AssetRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sources = store.assets_by_ids(ids).await?;
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        // Snapshot the affected branches before inserting anything so clones
        // created for one source never leak into another source's subtree.
        let mut branch_rows: HashMap<(i64, String), Vec<AssetRecord>> = HashMap::new();
        for source in &sources {
            let scope = (source.project_id, source.branch_id.clone());
            if !branch_rows.contains_key(&scope) {
                let rows = store
                    .assets_in_branch(source.project_id, &source.branch_id, BRANCH_QUERY_LIMIT)
                    .await?;
                branch_rows.insert(scope, rows);
            }
        }

        let retarget_root_path = match &retarget {
            Some((_, Some(parent_id))) => match store.asset_by_id(*parent_id).await? {
                Some(parent) => {
                    let mut path = asset_path(&parent);
                    path.push(parent.id);
                    Some(path)
                }
                None => Some(Vec::new()),
            },
            Some((_, None)) => Some(Vec::new()),
            None => None,
        };

        let mut created = Vec::new();
        for source in &sources {
            let root_path = match &retarget_root_path {
                Some(path) => path.clone(),
                None => asset_path(source),
            };
            let branch_id = match &retarget {
                Some((branch, _)) => branch.clone(),
                None => source.branch_id.clone(),
            };

            let clone_root = self
                .insert_clone(store, source, copy_name(&source.name), &branch_id, &root_path)
                .await?;

            let mut id_map: HashMap<i64, i64> = HashMap::new();
            id_map.insert(source.id, clone_root.id);
            created.push(clone_root);

            let mut source_prefix = asset_path(source);
            source_prefix.push(source.id);

            let scope = (source.project_id, source.branch_id.clone());
            let mut descendants: Vec<&AssetRecord> = branch_rows[&scope]
                .iter()
                .filter(|row| path_starts_with(&asset_path(row), &source_prefix))
                .collect();
            // Parents first, so every clone's remapped ancestor already exists.
            descendants.sort_by_key(|row| asset_path(row).len());

            for row in descendants {
                let row_path = asset_path(row);
                let suffix = &row_path[source_prefix.len()..];

                let mut clone_path = root_path.clone();
                clone_path.push(id_map[&source.id]);
                clone_path.extend(suffix.iter().map(|id| id_map.get(id).copied().unwrap_or(*id)));

                let clone = self
                    .insert_clone(store, row, row.name.clone(), &branch_id, &clone_path)
                    .await?;
                id_map.insert(row.id, clone.id);
                created.push(clone);
            }
        }

        Ok(created)
    }

    /// Insert one cloned row and rewrite its file descriptor to reference the
    /// clone's own id.
    async fn insert_clone(
        &self,
        store: &dyn ProjectStore,
        source: &AssetRecord,
        name: String,
        branch_id: &str,
        path: &[i64],
    ) -> store::Result<AssetRecord> {
        let mut clone = store
            .insert_asset(NewAsset {
                project_id: source.project_id,
                branch_id: branch_id.to_string(),
                owner_id: source.owner_id.clone(),
                name,
                asset_type: source.asset_type.clone(),
                data: data_with_path(&source.data, path),
                file: None,
                source_asset_id: None,
            })
            .await?;

        if let Some(file) = &source.file {
            let rewritten = rewrite_file_descriptor(file, &clone, branch_id);
            store.update_asset_file(clone.id, rewritten.clone()).await?;
            clone.file = Some(rewritten);
        }

        Ok(clone)
    }
}

/// The materialized path stored in an asset row's `data.path`, or empty.
pub fn asset_path(row: &AssetRecord) -> Vec<i64> {
    row.data
        .get("path")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

/// Exact ordered prefix comparison between materialized paths.
pub fn path_starts_with(path: &[i64], prefix: &[i64]) -> bool {
    path.len() >= prefix.len() && path[..prefix.len()] == *prefix
}

/// Next name in the copy sequence: `Box` -> `Box Copy` -> `Box Copy 2` -> ...
pub fn copy_name(name: &str) -> String {
    if name.ends_with(" Copy") {
        return format!("{name} 2");
    }
    if let Some(idx) = name.rfind(" Copy ") {
        let counter = &name[idx + " Copy ".len()..];
        if let Ok(n) = counter.parse::<u64>() {
            return format!("{} Copy {}", &name[..idx], n + 1);
        }
    }
    format!("{name} Copy")
}

/// A row's `data` column with `path` and `parentId` rewritten.
fn data_with_path(data: &Value, path: &[i64]) -> Value {
    let mut map = data.as_object().cloned().unwrap_or_default();
    map.insert("path".into(), json!(path));
    map.insert(
        "parentId".into(),
        path.last().map(|id| json!(id)).unwrap_or(Value::Null),
    );
    Value::Object(map)
}

/// File descriptor for a clone: same filename/size/mime, locator and URL
/// re-derived from the clone's identity.
fn rewrite_file_descriptor(file: &Value, clone: &AssetRecord, branch_id: &str) -> Value {
    let mut rewritten = file.as_object().cloned().unwrap_or_default();
    if let Some(filename) = file.get("filename").and_then(Value::as_str) {
        rewritten.insert(
            "url".into(),
            json!(format!("/api/assets/{}/file/{filename}", clone.id)),
        );
        rewritten.insert(
            "storagePath".into(),
            json!(format!(
                "{}/{}/{}/{filename}",
                clone.project_id, branch_id, clone.id
            )),
        );
    }
    Value::Object(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn asset(id: i64, name: &str, asset_type: &str, path: &[i64]) -> AssetRecord {
        AssetRecord {
            id,
            project_id: 1,
            branch_id: "main".into(),
            owner_id: "owner".into(),
            name: name.into(),
            asset_type: asset_type.into(),
            data: json!({
                "path": path,
                "parentId": path.last().copied(),
            }),
            file: None,
            source_asset_id: None,
            created_at: None,
        }
    }

    /// Folder 2 containing asset 3, folder 9 as a sibling move target.
    fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.add_asset(asset(2, "Folder", "folder", &[]));
        store.add_asset(asset(3, "Box", "material", &[2]));
        store.add_asset(asset(9, "Target", "folder", &[]));
        store
    }

    fn tree(store: &Arc<InMemoryStore>) -> AssetTree {
        AssetTree::new(
            Arc::new(DocumentEngine::new()),
            Some(Arc::clone(store) as Arc<dyn ProjectStore>),
        )
    }

    async fn stored_path(store: &InMemoryStore, id: i64) -> Vec<i64> {
        asset_path(&store.asset_by_id(id).await.unwrap().unwrap())
    }

    #[test]
    fn test_copy_name_sequence() {
        assert_eq!(copy_name("Box"), "Box Copy");
        assert_eq!(copy_name("Box Copy"), "Box Copy 2");
        assert_eq!(copy_name("Box Copy 2"), "Box Copy 3");
        assert_eq!(copy_name("Box Copy 9"), "Box Copy 10");
    }

    #[test]
    fn test_path_starts_with_is_exact_and_ordered() {
        assert!(path_starts_with(&[1, 2, 3], &[1, 2]));
        assert!(path_starts_with(&[1, 2], &[1, 2]));
        assert!(!path_starts_with(&[2, 1, 3], &[1, 2]));
        assert!(!path_starts_with(&[1], &[1, 2]));
        assert!(path_starts_with(&[1], &[]));
    }

    #[tokio::test]
    async fn test_move_rewrites_root_and_descendants() {
        let store = seeded_store();
        let tree = tree(&store);

        let patches = tree.move_assets(&[2], Some(9)).await;

        assert_eq!(stored_path(&store, 2).await, vec![9]);
        assert_eq!(stored_path(&store, 3).await, vec![9, 2]);
        assert_eq!(
            patches,
            vec![
                PathPatch { unique_id: 2, path: vec![9] },
                PathPatch { unique_id: 3, path: vec![9, 2] },
            ]
        );
    }

    #[tokio::test]
    async fn test_move_to_root() {
        let store = seeded_store();
        let tree = tree(&store);

        tree.move_assets(&[3], None).await;

        assert_eq!(stored_path(&store, 3).await, Vec::<i64>::new());
        let row = store.asset_by_id(3).await.unwrap().unwrap();
        assert_eq!(row.data["parentId"], Value::Null);
    }

    #[tokio::test]
    async fn test_move_with_descendant_in_ids_moves_subtree_once() {
        let store = seeded_store();
        let tree = tree(&store);

        let patches = tree.move_assets(&[2, 3], Some(9)).await;

        // Same outcome as moving only the folder.
        assert_eq!(stored_path(&store, 2).await, vec![9]);
        assert_eq!(stored_path(&store, 3).await, vec![9, 2]);
        assert_eq!(patches.len(), 2);
    }

    #[tokio::test]
    async fn test_move_patches_live_documents() {
        let store = seeded_store();
        let engine = Arc::new(DocumentEngine::new());
        let tree = AssetTree::new(
            Arc::clone(&engine),
            Some(Arc::clone(&store) as Arc<dyn ProjectStore>),
        );

        let key = DocKey::new("assets", "3");
        engine
            .create_document(key.clone(), json!({ "path": [2], "data": { "path": [2] } }))
            .await;

        tree.move_assets(&[3], Some(9)).await;

        let (_, doc) = engine.fetch(&key).await.unwrap();
        assert_eq!(doc["path"], json!([9]));
        assert_eq!(doc["data"]["path"], json!([9]));
    }

    #[tokio::test]
    async fn test_move_live_patch_is_idempotent() {
        let store = seeded_store();
        let engine = Arc::new(DocumentEngine::new());
        let tree = AssetTree::new(
            Arc::clone(&engine),
            Some(Arc::clone(&store) as Arc<dyn ProjectStore>),
        );

        let key = DocKey::new("assets", "3");
        engine
            .create_document(key.clone(), json!({ "path": [2], "data": { "path": [2] } }))
            .await;

        tree.move_assets(&[3], Some(9)).await;
        let (version_after_first, _) = engine.fetch(&key).await.unwrap();
        tree.move_assets(&[3], Some(9)).await;
        let (version_after_second, _) = engine.fetch(&key).await.unwrap();

        // Second move computes identical paths; no patch is written.
        assert_eq!(version_after_first, version_after_second);
    }

    #[tokio::test]
    async fn test_move_unknown_ids_is_noop() {
        let store = seeded_store();
        let tree = tree(&store);

        let patches = tree.move_assets(&[404], Some(9)).await;

        assert!(patches.is_empty());
    }

    #[tokio::test]
    async fn test_delete_folder_cascades() {
        let store = seeded_store();
        let tree = tree(&store);

        let deleted = tree.delete_assets(&[2]).await;

        assert_eq!(deleted, vec![2, 3]);
        assert!(store.asset_by_id(2).await.unwrap().is_none());
        assert!(store.asset_by_id(3).await.unwrap().is_none());
        assert!(store.asset_by_id(9).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_non_folder_does_not_expand() {
        let store = seeded_store();
        // A non-folder row with a child-shaped path underneath it.
        store.add_asset(asset(4, "NotFolder", "material", &[]));
        store.add_asset(asset(5, "Stray", "material", &[4]));
        let tree = tree(&store);

        let deleted = tree.delete_assets(&[4]).await;

        assert_eq!(deleted, vec![4]);
        assert!(store.asset_by_id(5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_unknown_id_is_silent() {
        let store = seeded_store();
        let tree = tree(&store);

        assert!(tree.delete_assets(&[404]).await.is_empty());
        assert_eq!(store.asset_count(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_clones_subtree_with_remapped_parents() {
        let store = seeded_store();
        let tree = tree(&store);

        let created = tree.duplicate_assets(&[2]).await;

        assert_eq!(created.len(), 2);
        let folder_clone = &created[0];
        let child_clone = &created[1];

        assert_eq!(folder_clone.name, "Folder Copy");
        assert_eq!(asset_path(folder_clone), Vec::<i64>::new());

        // The child keeps its name but hangs off the cloned folder.
        assert_eq!(child_clone.name, "Box");
        assert_eq!(asset_path(child_clone), vec![folder_clone.id]);
        assert_eq!(child_clone.data["parentId"], json!(folder_clone.id));
    }

    #[tokio::test]
    async fn test_duplicate_counter_naming() {
        let store = seeded_store();
        let tree = tree(&store);

        let first = tree.duplicate_assets(&[3]).await;
        assert_eq!(first[0].name, "Box Copy");

        let second = tree.duplicate_assets(&[first[0].id]).await;
        assert_eq!(second[0].name, "Box Copy 2");

        let third = tree.duplicate_assets(&[second[0].id]).await;
        assert_eq!(third[0].name, "Box Copy 3");
    }

    #[tokio::test]
    async fn test_duplicate_rewrites_file_descriptor() {
        let store = seeded_store();
        let mut with_file = asset(7, "Tex", "texture", &[]);
        with_file.file = Some(json!({
            "filename": "tex.png",
            "size": 4,
            "mime": "image/png",
            "url": "/api/assets/7/file/tex.png",
            "storagePath": "1/main/7/tex.png",
        }));
        store.add_asset(with_file);
        let tree = tree(&store);

        let created = tree.duplicate_assets(&[7]).await;

        let file = created[0].file.as_ref().unwrap();
        let id = created[0].id;
        assert_eq!(file["filename"], "tex.png");
        assert_eq!(file["url"], json!(format!("/api/assets/{id}/file/tex.png")));
        assert_eq!(file["storagePath"], json!(format!("1/main/{id}/tex.png")));
    }

    #[tokio::test]
    async fn test_paste_retargets_parent_and_branch() {
        let store = seeded_store();
        let tree = tree(&store);

        let created = tree.paste_assets(&[3], "feature", Some(9)).await;

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].branch_id, "feature");
        assert_eq!(asset_path(&created[0]), vec![9]);
        assert_eq!(created[0].name, "Box Copy");
    }

    #[tokio::test]
    async fn test_paste_to_root_of_branch() {
        let store = seeded_store();
        let tree = tree(&store);

        let created = tree.paste_assets(&[3], "main", None).await;

        assert_eq!(asset_path(&created[0]), Vec::<i64>::new());
        assert_eq!(created[0].data["parentId"], Value::Null);
    }

    #[tokio::test]
    async fn test_tree_invariant_after_mixed_operations() {
        let store = seeded_store();
        store.add_asset(asset(10, "Deep", "folder", &[2]));
        store.add_asset(asset(11, "Leaf", "material", &[2, 10]));
        let tree = tree(&store);

        tree.move_assets(&[2], Some(9)).await;
        tree.duplicate_assets(&[2]).await;
        tree.delete_assets(&[3]).await;

        // Every remaining row's parentId is the last element of its path.
        for row in store.list_assets(100).await.unwrap() {
            let path = asset_path(&row);
            let parent = row.data["parentId"].as_i64();
            assert_eq!(parent, path.last().copied(), "row {}", row.id);
        }
    }
}
