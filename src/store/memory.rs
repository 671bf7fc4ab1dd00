//! In-memory resource store with change notifications.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::core::resource::{Resource, ResourceKey, ResourceType};
use crate::errors::{Error, Result};
use crate::store::ResourceStore;

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Create,
    Update,
    Delete,
}

/// Change notification emitted after every successful write.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub op: StoreOp,
    pub resource_type: ResourceType,
    pub key: ResourceKey,
}

type TypeMap = BTreeMap<ResourceKey, Resource>;

pub struct InMemoryStore {
    // BTreeMap per type keeps list() in stable (mesh, name) order.
    resources: RwLock<HashMap<ResourceType, TypeMap>>,
    events: broadcast::Sender<StoreEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { resources: RwLock::new(HashMap::new()), events }
    }

    /// Subscribe to change notifications. Used by the ingress reconciler to
    /// debounce its ticks.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, op: StoreOp, resource_type: ResourceType, key: ResourceKey) {
        // No subscribers is fine.
        let _ = self.events.send(StoreEvent { op, resource_type, key });
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, resource_type: ResourceType, key: &ResourceKey) -> Result<Resource> {
        let resources = self.resources.read().await;
        resources
            .get(&resource_type)
            .and_then(|by_key| by_key.get(key))
            .cloned()
            .ok_or_else(|| Error::not_found(resource_type, key.mesh.clone(), key.name.clone()))
    }

    async fn list(&self, resource_type: ResourceType, mesh: Option<&str>) -> Result<Vec<Resource>> {
        let resources = self.resources.read().await;
        let Some(by_key) = resources.get(&resource_type) else {
            return Ok(Vec::new());
        };
        Ok(by_key
            .values()
            .filter(|r| mesh.map(|m| r.meta.mesh == m).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create(&self, mut resource: Resource) -> Result<Resource> {
        let resource_type = resource.resource_type();
        let key = resource.key();
        let mut resources = self.resources.write().await;
        let by_key = resources.entry(resource_type).or_default();
        if by_key.contains_key(&key) {
            return Err(Error::conflict(resource_type, key.mesh, key.name));
        }
        let now = Utc::now();
        resource.meta.version = 1;
        resource.meta.creation_time = now;
        resource.meta.modification_time = now;
        by_key.insert(key.clone(), resource.clone());
        drop(resources);
        self.notify(StoreOp::Create, resource_type, key);
        Ok(resource)
    }

    async fn update(&self, mut resource: Resource) -> Result<Resource> {
        let resource_type = resource.resource_type();
        let key = resource.key();
        let mut resources = self.resources.write().await;
        let by_key = resources.entry(resource_type).or_default();
        let existing = by_key
            .get(&key)
            .ok_or_else(|| Error::not_found(resource_type, key.mesh.clone(), key.name.clone()))?;
        if existing.meta.version != resource.meta.version {
            return Err(Error::conflict(resource_type, key.mesh, key.name));
        }
        resource.meta.version += 1;
        resource.meta.creation_time = existing.meta.creation_time;
        resource.meta.modification_time = Utc::now();
        by_key.insert(key.clone(), resource.clone());
        drop(resources);
        self.notify(StoreOp::Update, resource_type, key);
        Ok(resource)
    }

    async fn delete(&self, resource_type: ResourceType, key: &ResourceKey) -> Result<()> {
        let mut resources = self.resources.write().await;
        let removed = resources.get_mut(&resource_type).and_then(|by_key| by_key.remove(key));
        drop(resources);
        match removed {
            Some(_) => {
                self.notify(StoreOp::Delete, resource_type, key.clone());
                Ok(())
            }
            None => Err(Error::not_found(resource_type, key.mesh.clone(), key.name.clone())),
        }
    }

    async fn list_many(
        &self,
        resource_types: &[ResourceType],
        mesh: Option<&str>,
    ) -> Result<Vec<Vec<Resource>>> {
        // One read guard across every type: the cut is consistent.
        let resources = self.resources.read().await;
        Ok(resource_types
            .iter()
            .map(|resource_type| {
                resources
                    .get(resource_type)
                    .map(|by_key| {
                        by_key
                            .values()
                            .filter(|r| mesh.map(|m| r.meta.mesh == m).unwrap_or(true))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mesh::MeshSpec;
    use crate::core::resource::ResourceSpec;

    #[tokio::test]
    async fn writes_emit_events() {
        let store = InMemoryStore::new();
        let mut events = store.subscribe();

        let mesh = Resource::new("default", "default", ResourceSpec::Mesh(MeshSpec::default()));
        let created = store.create(mesh).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.op, StoreOp::Create);
        assert_eq!(event.resource_type, ResourceType::Mesh);
        assert_eq!(event.key.name, "default");

        store.delete(ResourceType::Mesh, &created.key()).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.op, StoreOp::Delete);
    }

    #[tokio::test]
    async fn delete_of_missing_resource_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .delete(ResourceType::Mesh, &ResourceKey::new("default", "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
