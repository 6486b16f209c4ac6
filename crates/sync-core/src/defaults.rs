//! Built-in default templates for documents created on demand.
//!
//! These are the versioned defaults the lifecycle manager seeds new documents
//! from and migrates stale documents toward. Settings defaults are selected
//! by the identity prefix of the settings document.

use serde_json::{Value, json};

/// Name of the environment-map asset seeded once per project/branch.
pub const DEFAULT_ENV_MAP_ASSET_NAME: &str = "Default Skybox";

/// Filename recorded on the environment-map asset's file descriptor.
pub const DEFAULT_ENV_MAP_FILENAME: &str = "default-skybox-env-atlas.png";

fn default_editor_settings() -> Value {
    json!({
        "gridDivisions": 32,
        "gridDivisionSize": 1,
        "snapIncrement": 1,
        "gizmoSize": 1,
        "gizmoPreset": "default",
        "cameraGrabDepth": false,
        "cameraGrabColor": false,
        "cameraNearClip": 0.1,
        "cameraFarClip": 1000,
        "cameraClearColor": [0.2, 0.2, 0.2, 1],
        "cameraToneMapping": 0,
        "cameraGammaCorrection": 1,
        "showFog": true,
        "iconSize": 1
    })
}

/// Settings shared by every member of a project.
pub fn project_only_settings() -> Value {
    json!({
        "engineV2": true,
        "useLegacyScripts": false,
        "scripts": [],
        "loadingScreenScript": null
    })
}

/// Per-user-per-project settings (editor preferences plus branch bookmarks).
pub fn project_user_settings() -> Value {
    json!({
        "editor": default_editor_settings(),
        "branch": null,
        "favoriteBranches": []
    })
}

/// Per-user settings independent of any project.
pub fn user_settings() -> Value {
    json!({ "editor": default_editor_settings() })
}

/// Default render/physics settings seeded into a new scene.
pub fn scene_settings() -> Value {
    json!({
        "physics": {
            "gravity": [0, -9.8, 0]
        },
        "render": {
            "fog_end": 1000,
            "fog_start": 1,
            "global_ambient": [0.3, 0.3, 0.3],
            "fog_color": [0, 0, 0],
            "fog": "none",
            "fog_density": 0.01,
            "gamma_correction": 1,
            "tonemapping": 0,
            "exposure": 1.2,
            "skyboxIntensity": 1,
            "skyboxRotation": [0, 0, 0],
            "skyboxMip": 0,
            "lightmapSizeMultiplier": 16,
            "lightmapMaxResolution": 2048,
            "lightmapMode": 1
        }
    })
}

/// Default entity tree seeded into a new scene: a root node holding a camera
/// and a directional light.
pub fn scene_entities() -> Value {
    json!({
        "root": {
            "name": "Root",
            "parent": null,
            "resource_id": "root",
            "tags": [],
            "enabled": true,
            "components": {},
            "scale": [1, 1, 1],
            "position": [0, 0, 0],
            "rotation": [0, 0, 0],
            "children": ["camera", "light"]
        },
        "camera": {
            "name": "Camera",
            "parent": "root",
            "resource_id": "camera",
            "tags": [],
            "enabled": true,
            "components": {
                "camera": {
                    "fov": 45,
                    "projection": 0,
                    "clearColor": [0.22, 0.34, 0.52, 1],
                    "clearColorBuffer": true,
                    "clearDepthBuffer": true,
                    "frustumCulling": true,
                    "enabled": true,
                    "orthoHeight": 4,
                    "farClip": 1000,
                    "nearClip": 0.1,
                    "priority": 0,
                    "rect": [0, 0, 1, 1],
                    "layers": [0, 1, 2, 3, 4]
                }
            },
            "scale": [1, 1, 1],
            "position": [4, 3.5, 4],
            "rotation": [-30, 45, 0],
            "children": []
        },
        "light": {
            "name": "Directional Light",
            "parent": "root",
            "resource_id": "light",
            "tags": [],
            "enabled": true,
            "components": {
                "light": {
                    "enabled": true,
                    "bake": false,
                    "bakeDir": true,
                    "affectDynamic": true,
                    "affectLightmapped": false,
                    "isStatic": false,
                    "color": [1, 1, 1],
                    "intensity": 1.5,
                    "type": "directional",
                    "shadowDistance": 40,
                    "range": 8,
                    "innerConeAngle": 40,
                    "outerConeAngle": 45,
                    "shape": 0,
                    "falloffMode": 0,
                    "castShadows": true,
                    "shadowUpdateMode": 2,
                    "shadowType": 1,
                    "shadowResolution": 2048,
                    "shadowBias": 0.2,
                    "normalOffsetBias": 0.05,
                    "vsmBlurMode": 1,
                    "vsmBlurSize": 11,
                    "vsmBias": 0.01,
                    "cookieAsset": null,
                    "cookieIntensity": 1,
                    "cookieFalloff": true,
                    "cookieChannel": "rgb",
                    "cookieAngle": 0,
                    "cookieScale": [1, 1],
                    "cookieOffset": [0, 0],
                    "layers": [0]
                }
            },
            "scale": [1, 1, 1],
            "position": [3, 5, -3],
            "rotation": [45, 45, 0],
            "children": []
        }
    })
}

/// Cubemap data recorded on the default environment-map asset. The env-atlas
/// file carries the actual prefiltered map; the six texture slots stay null.
pub fn env_map_asset_data() -> Value {
    json!({
        "name": DEFAULT_ENV_MAP_ASSET_NAME,
        "textures": [null, null, null, null, null, null],
        "type": "rgbp",
        "minFilter": 1,
        "magFilter": 1,
        "anisotropy": 1,
        "rgbm": false,
        "mipmaps": false
    })
}

/// Select settings defaults by the scope encoded in the document identity.
///
/// `project_settings_*` is project-only scope, `project_*` is
/// per-user-per-project, `user_*` is per-user, and `project-private_*` starts
/// empty. Unrecognized identities fall back to project-only defaults.
pub fn settings_defaults_for_id(id: &str) -> Value {
    if id.starts_with("project_settings_") {
        project_only_settings()
    } else if id.starts_with("project_") {
        project_user_settings()
    } else if id.starts_with("user_") {
        user_settings()
    } else if id.starts_with("project-private_") {
        json!({})
    } else {
        project_only_settings()
    }
}
