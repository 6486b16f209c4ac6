//! sync-core: Shared library for the collaborative workspace synchronization
//! service.
//!
//! This crate provides the core functionality for:
//! - Merging stored documents with versioned default templates
//! - Demand-creating and migrating live documents (scenes, assets, settings)
//! - Structural asset-tree mutations over materialized paths
//! - The wire protocol spoken by editor clients on the three socket endpoints
//! - Store and object-storage trait abstractions
#![recursion_limit = "512"]

pub mod defaults;
pub mod engine;
pub mod lifecycle;
pub mod merge;
pub mod objects;
pub mod protocol;
pub mod store;
pub mod tree;

pub use engine::{DocKey, DocumentEngine, EngineSession};
pub use lifecycle::DocumentManager;
pub use merge::merge_defaults;
pub use protocol::{Collection, SyncFrame};
pub use store::{AssetRecord, InMemoryStore, NewAsset, ProjectStore, SceneRecord};
pub use tree::AssetTree;
