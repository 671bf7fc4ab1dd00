//! Core resource model: typed resources grouped in meshes.
//!
//! Specs are plain serde structs; tag maps are `BTreeMap` so every
//! serialization of the same spec is byte-identical.

pub mod dataplane;
pub mod mesh;
pub mod policy;
pub mod resource;

pub use dataplane::{DataplaneInsightSpec, DataplaneSpec};
pub use mesh::MeshSpec;
pub use resource::{Resource, ResourceKey, ResourceMeta, ResourceSpec, ResourceType, Tags};
