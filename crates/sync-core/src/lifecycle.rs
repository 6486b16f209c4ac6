//! Demand-creation and migration of live documents.
//!
//! Every document a client may address is ensured before the engine sees the
//! request: scenes and settings are seeded from built-in defaults (and
//! migrated toward them when they already exist), assets resolve their
//! persisted row when the store is reachable, user data starts empty.
//!
//! The persisted store is enrichment, never a hard dependency: every store or
//! object-storage failure is logged and the document is still created from
//! defaults, so a missing enrichment never blocks collaboration.

use crate::defaults;
use crate::engine::{DocKey, DocumentEngine, PatchOp};
use crate::merge::merge_defaults;
use crate::objects::ObjectStore;
use crate::protocol::Collection;
use crate::store::{ProjectStore, SceneRecord};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Bound on the startup seed pass over scene rows.
const SCENE_SEED_LIMIT: usize = 200;
/// Bound on the startup seed pass over asset rows.
const ASSET_SEED_LIMIT: usize = 500;

/// Bundled 1x1 placeholder texture uploaded as the default environment map.
const ENV_MAP_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR4nGNgYAAAAAMAASsJTYQAAAAASUVORK5CYII=";

/// Seed identity for a scene document, built either from a persisted row or
/// from an on-demand client request.
#[derive(Debug, Clone)]
pub struct SceneSeed {
    /// Document id on the sync channel (the scene's unique id).
    pub doc_id: String,
    /// The `item_id` recorded in the document (numeric when known).
    pub item_id: Value,
    pub branch_id: String,
    pub name: String,
}

impl SceneSeed {
    pub fn from_record(record: &SceneRecord) -> Self {
        Self {
            doc_id: record
                .unique_id
                .clone()
                .unwrap_or_else(|| record.id.to_string()),
            item_id: json!(record.id),
            branch_id: record.branch_id.clone().unwrap_or_else(|| "local".into()),
            name: record.name.clone().unwrap_or_else(|| "Main Scene".into()),
        }
    }

    /// Seed for a scene a client addressed before any row was observed.
    pub fn on_demand(id: &str) -> Self {
        Self {
            doc_id: id.to_string(),
            item_id: id
                .parse::<i64>()
                .map(|n| json!(n))
                .unwrap_or_else(|_| json!(id)),
            branch_id: "local".into(),
            name: format!("Scene {id}"),
        }
    }
}

/// Ensures documents exist (and stay shaped like the current defaults)
/// before the engine processes client requests for them.
pub struct DocumentManager {
    engine: Arc<DocumentEngine>,
    store: Option<Arc<dyn ProjectStore>>,
    objects: Option<Arc<dyn ObjectStore>>,
    env_map_enabled: bool,
    /// Resolved environment-map asset per `project:branch`. Held across the
    /// whole bootstrap so concurrent ensures cannot double-upload.
    env_map_cache: Mutex<HashMap<String, i64>>,
}

impl DocumentManager {
    pub fn new(engine: Arc<DocumentEngine>) -> Self {
        Self {
            engine,
            store: None,
            objects: None,
            env_map_enabled: true,
            env_map_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ProjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Toggle the default environment-map bootstrap.
    pub fn with_env_map(mut self, enabled: bool) -> Self {
        self.env_map_enabled = enabled;
        self
    }

    /// Ensure a document exists for `(collection, id)`. Idempotent and safe
    /// under concurrent callers: creation is fetch-then-create inside the
    /// engine, and a lost race is a no-op.
    pub async fn ensure_document(&self, collection: Collection, id: &str) {
        match collection {
            Collection::Scenes => self.ensure_scene(&SceneSeed::on_demand(id)).await,
            Collection::Assets => self.ensure_asset(id).await,
            Collection::Settings => self.ensure_settings(id).await,
            Collection::UserData => {
                self.engine
                    .create_document(DocKey::new(Collection::UserData.as_str(), id), json!({}))
                    .await;
            }
        }
    }

    /// Seed documents for persisted scene and asset rows. Bounded queries;
    /// errors are logged and the pass continues.
    pub async fn seed_from_store(&self) {
        let Some(store) = self.store.clone() else {
            info!("store not configured, skipping document seed");
            return;
        };

        match store.list_scenes(SCENE_SEED_LIMIT).await {
            Ok(scenes) => {
                for scene in &scenes {
                    self.ensure_scene(&SceneSeed::from_record(scene)).await;
                }
                info!("seeded {} scene document(s)", scenes.len());
            }
            Err(err) => error!("failed to load scenes for seeding: {err}"),
        }

        match store.list_assets(ASSET_SEED_LIMIT).await {
            Ok(assets) => {
                for asset in &assets {
                    self.engine
                        .create_document(
                            DocKey::new(Collection::Assets.as_str(), asset.id.to_string()),
                            asset_doc(asset),
                        )
                        .await;
                }
                info!("seeded {} asset document(s)", assets.len());
            }
            Err(err) => error!("failed to load assets for seeding: {err}"),
        }
    }

    /// Ensure a scene document: create it from the seeded default entity
    /// tree and settings, or migrate an existing one toward the current
    /// defaults with a single compare-before-write patch.
    pub async fn ensure_scene(&self, seed: &SceneSeed) {
        let key = DocKey::new(Collection::Scenes.as_str(), &seed.doc_id);

        let Some((_, current)) = self.engine.fetch(&key).await else {
            let mut base = json!({
                "item_id": seed.item_id,
                "branch_id": seed.branch_id,
                "name": seed.name,
                "entities": defaults::scene_entities(),
                "settings": defaults::scene_settings(),
            });

            if let Some(asset_id) = self.resolve_scene_env_map(seed).await {
                if base["settings"]["render"]["skybox"].is_null() {
                    base["settings"]["render"]["skybox"] = json!(asset_id);
                }
            }

            self.engine.create_document(key, base).await;
            return;
        };

        let current_settings = current.get("settings").cloned().unwrap_or_else(|| json!({}));
        let next_settings = merge_defaults(&current_settings, &defaults::scene_settings());

        let current_entities = current.get("entities").cloned().unwrap_or_else(|| json!({}));
        let has_entities = current_entities
            .as_object()
            .is_some_and(|map| !map.is_empty());
        let next_entities = if has_entities {
            current_entities.clone()
        } else {
            defaults::scene_entities()
        };

        let mut ops = Vec::new();
        if next_settings != current_settings {
            ops.push(PatchOp::replace(
                vec![json!("settings")],
                current_settings.clone(),
                next_settings.clone(),
            ));
        }
        if next_entities != current_entities {
            ops.push(PatchOp::replace(
                vec![json!("entities")],
                current_entities,
                next_entities,
            ));
        }

        if let Some(asset_id) = self.resolve_scene_env_map(seed).await {
            let settings_op = ops
                .iter()
                .position(|op| op.p == vec![json!("settings")]);
            let effective = settings_op
                .and_then(|idx| ops[idx].oi.clone())
                .unwrap_or_else(|| next_settings.clone());

            let current_skybox = effective
                .get("render")
                .and_then(|render| render.get("skybox"))
                .cloned()
                .unwrap_or(Value::Null);

            if current_skybox != json!(asset_id) {
                let mut with_skybox = effective;
                if !with_skybox.is_object() {
                    with_skybox = json!({});
                }
                if !with_skybox["render"].is_object() {
                    with_skybox["render"] = json!({});
                }
                with_skybox["render"]["skybox"] = json!(asset_id);

                match settings_op {
                    Some(idx) => ops[idx].oi = Some(with_skybox),
                    None => ops.push(PatchOp::replace(
                        vec![json!("settings")],
                        current_settings,
                        with_skybox,
                    )),
                }
            }
        }

        if !ops.is_empty() {
            debug!("migrating scene document {}", seed.doc_id);
            self.engine.submit_patch(&key, ops).await;
        }
    }

    /// Ensure a settings document: defaults are selected by the identity
    /// prefix; existing documents are merged and patched only when changed.
    pub async fn ensure_settings(&self, id: &str) {
        let key = DocKey::new(Collection::Settings.as_str(), id);
        let settings_defaults = defaults::settings_defaults_for_id(id);

        let Some((_, current)) = self.engine.fetch(&key).await else {
            self.engine.create_document(key, settings_defaults).await;
            return;
        };

        let current = if current.is_object() { current } else { json!({}) };
        let next = merge_defaults(&current, &settings_defaults);
        if next != current {
            debug!("migrating settings document {id}");
            self.engine
                .submit_patch(&key, vec![PatchOp::replace(vec![], current, next)])
                .await;
        }
    }

    /// Ensure an asset document, resolving the persisted row by id when the
    /// store is reachable and falling back to a placeholder shape otherwise.
    pub async fn ensure_asset(&self, id: &str) {
        let key = DocKey::new(Collection::Assets.as_str(), id);
        if self.engine.exists(&key).await {
            return;
        }

        let resolved = match (&self.store, id.parse::<i64>()) {
            (Some(store), Ok(numeric_id)) => match store.asset_by_id(numeric_id).await {
                Ok(row) => row.map(|row| asset_doc(&row)),
                Err(err) => {
                    warn!("asset row lookup failed for {id}: {err}");
                    None
                }
            },
            _ => None,
        };

        let value = resolved.unwrap_or_else(|| placeholder_asset_doc(id));
        self.engine.create_document(key, value).await;
    }

    /// Resolve the default environment-map asset for the project/branch that
    /// owns a scene. Best effort: any missing link returns `None` and the
    /// scene proceeds without the reference.
    async fn resolve_scene_env_map(&self, seed: &SceneSeed) -> Option<i64> {
        if !self.env_map_enabled {
            return None;
        }
        let store = self.store.clone()?;

        let row = match store.scene_by_unique_id(&seed.doc_id).await {
            Ok(row) => row,
            Err(err) => {
                warn!("scene row lookup failed for {}: {err}", seed.doc_id);
                None
            }
        };
        let row = match row {
            Some(row) => Some(row),
            None => match seed.doc_id.parse::<i64>() {
                Ok(numeric_id) => store.scene_by_id(numeric_id).await.ok().flatten(),
                Err(_) => None,
            },
        };
        let row = row?;

        let branch_id = row
            .branch_id
            .filter(|id| is_uuid(id))
            .or_else(|| Some(seed.branch_id.clone()).filter(|id| is_uuid(id)));
        let branch_id = match branch_id {
            Some(id) => Some(id),
            None => match store.earliest_branch(row.project_id).await {
                Ok(branch) => branch,
                Err(err) => {
                    warn!("branch lookup failed for project {}: {err}", row.project_id);
                    None
                }
            },
        }?;

        let owner_id = row.owner_id.unwrap_or_else(|| "anonymous".into());
        self.ensure_default_environment_map(row.project_id, &branch_id, &owner_id)
            .await
    }

    /// Idempotent upsert of the default environment-map asset: one row and
    /// one uploaded texture per project/branch, cached after the first
    /// resolution.
    pub async fn ensure_default_environment_map(
        &self,
        project_id: i64,
        branch_id: &str,
        owner_id: &str,
    ) -> Option<i64> {
        if !self.env_map_enabled {
            return None;
        }
        let store = self.store.clone()?;

        let cache_key = format!("{project_id}:{branch_id}");
        let mut cache = self.env_map_cache.lock().await;
        if let Some(asset_id) = cache.get(&cache_key) {
            return Some(*asset_id);
        }

        let existing = match store
            .find_asset(
                project_id,
                branch_id,
                "cubemap",
                defaults::DEFAULT_ENV_MAP_ASSET_NAME,
            )
            .await
        {
            Ok(existing) => existing,
            Err(err) => {
                warn!("default environment map: lookup failed: {err}");
                return None;
            }
        };

        let resolved_owner = if is_uuid(owner_id) {
            Some(owner_id.to_string())
        } else {
            match store.project_owner(project_id).await {
                Ok(owner) => owner.filter(|id| is_uuid(id)),
                Err(err) => {
                    warn!("default environment map: owner lookup failed: {err}");
                    None
                }
            }
        };
        let Some(resolved_owner) = resolved_owner else {
            warn!("default environment map: missing valid owner id; skipping asset insert");
            return None;
        };

        let asset_id = match &existing {
            Some(row) => row.id,
            None => {
                match store
                    .insert_asset(crate::store::NewAsset {
                        project_id,
                        branch_id: branch_id.to_string(),
                        owner_id: resolved_owner,
                        name: defaults::DEFAULT_ENV_MAP_ASSET_NAME.into(),
                        asset_type: "cubemap".into(),
                        data: defaults::env_map_asset_data(),
                        file: None,
                        source_asset_id: None,
                    })
                    .await
                {
                    Ok(row) => row.id,
                    Err(err) => {
                        warn!("default environment map: asset insert failed: {err}");
                        return None;
                    }
                }
            }
        };

        let storage_path = format!(
            "{project_id}/{branch_id}/{asset_id}/{}",
            defaults::DEFAULT_ENV_MAP_FILENAME
        );

        // When the row already records the file, the texture is assumed
        // uploaded and the upload is skipped.
        let has_file_recorded = existing
            .as_ref()
            .and_then(|row| row.file.as_ref())
            .is_some_and(|file| {
                file.get("storagePath").and_then(Value::as_str).is_some()
                    && file.get("filename").and_then(Value::as_str)
                        == Some(defaults::DEFAULT_ENV_MAP_FILENAME)
            });

        if !has_file_recorded {
            let Some(objects) = self.objects.clone() else {
                warn!("default environment map: object storage not configured; skipping upload");
                return None;
            };

            let content = BASE64
                .decode(ENV_MAP_PNG_BASE64)
                .expect("bundled texture should be valid base64");
            if let Err(err) = objects.upload(&storage_path, &content, "image/png").await {
                warn!("default environment map: upload failed: {err}");
                return None;
            }

            let file_info = json!({
                "filename": defaults::DEFAULT_ENV_MAP_FILENAME,
                "size": content.len(),
                "mime": "image/png",
                "url": format!(
                    "/api/assets/{asset_id}/file/{}",
                    defaults::DEFAULT_ENV_MAP_FILENAME
                ),
                "storagePath": storage_path,
            });
            if let Err(err) = store.update_asset_file(asset_id, file_info).await {
                // Not fatal; the texture exists in storage.
                warn!("default environment map: file record update failed: {err}");
            }
        }

        if let Some(row) = &existing {
            let current_data = if row.data.is_object() {
                row.data.clone()
            } else {
                json!({})
            };
            let expected = defaults::env_map_asset_data();
            let needs_update = current_data["type"] != expected["type"]
                || current_data["minFilter"] != expected["minFilter"]
                || current_data["magFilter"] != expected["magFilter"]
                || current_data["mipmaps"] != expected["mipmaps"]
                || current_data["rgbm"] != expected["rgbm"]
                || !current_data["textures"].is_array();

            if needs_update {
                let mut repaired = current_data.as_object().cloned().unwrap_or_default();
                if let Some(expected_map) = expected.as_object() {
                    for (field, value) in expected_map {
                        repaired.insert(field.clone(), value.clone());
                    }
                }
                if let Err(err) = store
                    .update_asset_data(asset_id, Value::Object(repaired))
                    .await
                {
                    warn!("default environment map: data update failed: {err}");
                }
            }
        }

        cache.insert(cache_key, asset_id);
        Some(asset_id)
    }
}

/// Live-document shape of a persisted asset row.
pub fn asset_doc(row: &crate::store::AssetRecord) -> Value {
    let data = if row.data.is_object() {
        row.data.clone()
    } else {
        json!({})
    };
    let path = data.get("path").cloned().filter(Value::is_array).unwrap_or_else(|| json!([]));
    let preload = data
        .get("preload")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let source = data.get("source").and_then(Value::as_bool).unwrap_or(true);

    json!({
        "item_id": row.id,
        "branch_id": row.branch_id,
        "name": row.name,
        "type": row.asset_type,
        "file": row.file.clone().unwrap_or_else(|| json!({})),
        "data": data,
        "tags": [],
        "path": path,
        "preload": preload,
        "has_thumbnail": false,
        "source": source,
        "source_asset_id": row.source_asset_id,
    })
}

/// Placeholder document for an asset id the store could not resolve.
fn placeholder_asset_doc(id: &str) -> Value {
    let item_id = id
        .parse::<i64>()
        .map(|n| json!(n))
        .unwrap_or_else(|_| json!(id));
    json!({
        "item_id": item_id,
        "branch_id": "local",
        "name": format!("Asset {id}"),
        "type": "unknown",
        "file": {},
        "data": {},
        "tags": [],
        "path": [],
        "preload": true,
        "has_thumbnail": false,
        "source": true,
        "source_asset_id": null,
    })
}

fn is_uuid(value: &str) -> bool {
    uuid::Uuid::try_parse(value).is_ok()
}
