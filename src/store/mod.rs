//! Resource Store contract and the in-memory implementation.
//!
//! The store is the only cross-component mutable state. Writes use
//! optimistic concurrency: `update` carries the version read and fails with
//! `Conflict` on mismatch.

pub mod memory;
pub mod sync;

pub use memory::{InMemoryStore, StoreEvent, StoreOp};
pub use sync::{NamePrefilter, ResourceSyncer};

use async_trait::async_trait;

use crate::core::resource::{Resource, ResourceKey, ResourceType};
use crate::errors::Result;

/// Typed CRUD over named resources grouped in meshes.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, resource_type: ResourceType, key: &ResourceKey) -> Result<Resource>;

    /// List resources of a type, optionally scoped to one mesh. Results are
    /// returned in stable `(mesh, name)` order.
    async fn list(&self, resource_type: ResourceType, mesh: Option<&str>) -> Result<Vec<Resource>>;

    async fn create(&self, resource: Resource) -> Result<Resource>;

    /// Update; `resource.meta.version` must equal the stored version.
    async fn update(&self, resource: Resource) -> Result<Resource>;

    async fn delete(&self, resource_type: ResourceType, key: &ResourceKey) -> Result<()>;

    /// List several types under a single read lease so the results form a
    /// consistent cut. The default falls back to sequential lists; stores
    /// with snapshot reads override it.
    async fn list_many(
        &self,
        resource_types: &[ResourceType],
        mesh: Option<&str>,
    ) -> Result<Vec<Vec<Resource>>> {
        let mut out = Vec::with_capacity(resource_types.len());
        for resource_type in resource_types {
            out.push(self.list(*resource_type, mesh).await?);
        }
        Ok(out)
    }
}
