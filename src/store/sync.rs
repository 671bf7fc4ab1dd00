//! Applies a full upstream state for one resource type to the local store.
//!
//! The syncer compares the received list against the store view selected by
//! a prefilter and performs creates, updates and deletes in stable
//! `(mesh, name)` order so operation sequences are reproducible.

use std::sync::Arc;

use tracing::debug;

use crate::core::resource::{Resource, ResourceType};
use crate::errors::Result;
use crate::store::ResourceStore;

/// Scopes a sync to the resources a sink owns. Only resources passing the
/// filter are compared or removed; resources owned by other peers or of
/// local origin are never touched.
#[derive(Clone)]
pub struct NamePrefilter {
    suffix: String,
    k8s_suffix: String,
}

impl NamePrefilter {
    /// Match resources carrying the `.{peer}` origin marker the sink's name
    /// rewrite appends (with the extra `.default` namespace on Kubernetes
    /// stores).
    pub fn by_owner(owner: &str) -> Self {
        Self { suffix: format!(".{}", owner), k8s_suffix: format!(".{}.default", owner) }
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        resource.meta.name.ends_with(&self.suffix)
            || resource.meta.name.ends_with(&self.k8s_suffix)
    }
}

pub struct ResourceSyncer {
    store: Arc<dyn ResourceStore>,
}

impl ResourceSyncer {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Bring the store's prefiltered view of `resource_type` to exactly
    /// `upstream`.
    pub async fn sync(
        &self,
        resource_type: ResourceType,
        mut upstream: Vec<Resource>,
        prefilter: &NamePrefilter,
    ) -> Result<()> {
        upstream.sort_by(|a, b| a.key().cmp(&b.key()));

        let owned: Vec<Resource> = self
            .store
            .list(resource_type, None)
            .await?
            .into_iter()
            .filter(|r| prefilter.matches(r))
            .collect();

        let mut created = 0usize;
        let mut updated = 0usize;
        let mut deleted = 0usize;

        // Deletions first: anything owned that upstream no longer has.
        for existing in &owned {
            if !upstream.iter().any(|r| r.key() == existing.key()) {
                self.store.delete(resource_type, &existing.key()).await?;
                deleted += 1;
            }
        }

        for incoming in upstream {
            if !prefilter.matches(&incoming) {
                // The sink must never write resources it does not own.
                continue;
            }
            match owned.iter().find(|r| r.key() == incoming.key()) {
                Some(existing) if existing.spec == incoming.spec => {}
                Some(existing) => {
                    let mut next = incoming;
                    next.meta.version = existing.meta.version;
                    self.store.update(next).await?;
                    updated += 1;
                }
                None => {
                    self.store.create(incoming).await?;
                    created += 1;
                }
            }
        }

        debug!(
            resource_type = %resource_type,
            created, updated, deleted,
            "Synced upstream resources"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataplane::{DataplaneSpec, Networking};
    use crate::core::resource::ResourceSpec;
    use crate::store::InMemoryStore;
    use tokio_test::assert_ok;

    fn dataplane(mesh: &str, name: &str, address: &str) -> Resource {
        Resource::new(
            mesh,
            name,
            ResourceSpec::Dataplane(DataplaneSpec {
                networking: Networking { address: address.into(), ..Default::default() },
            }),
        )
    }

    #[tokio::test]
    async fn sync_creates_updates_and_deletes_owned_resources() {
        let store = Arc::new(InMemoryStore::new());
        let syncer = ResourceSyncer::new(store.clone());
        let prefilter = NamePrefilter::by_owner("zone-1");

        store.create(dataplane("default", "backend.zone-1", "10.0.0.1")).await.unwrap();
        store.create(dataplane("default", "stale.zone-1", "10.0.0.2")).await.unwrap();

        let upstream = vec![
            dataplane("default", "backend.zone-1", "10.0.0.9"),
            dataplane("default", "web.zone-1", "10.0.0.3"),
        ];
        assert_ok!(syncer.sync(ResourceType::Dataplane, upstream, &prefilter).await);

        let all = store.list(ResourceType::Dataplane, None).await.unwrap();
        let names: Vec<_> = all.iter().map(|r| r.meta.name.as_str()).collect();
        assert_eq!(names, vec!["backend.zone-1", "web.zone-1"]);
        assert_eq!(all[0].as_dataplane().unwrap().networking.address, "10.0.0.9");
    }

    #[tokio::test]
    async fn sync_never_touches_foreign_resources() {
        let store = Arc::new(InMemoryStore::new());
        let syncer = ResourceSyncer::new(store.clone());
        let prefilter = NamePrefilter::by_owner("zone-1");

        store.create(dataplane("default", "local-backend", "10.0.0.1")).await.unwrap();
        store.create(dataplane("default", "backend.zone-2", "10.0.0.2")).await.unwrap();

        syncer.sync(ResourceType::Dataplane, Vec::new(), &prefilter).await.unwrap();

        let all = store.list(ResourceType::Dataplane, None).await.unwrap();
        assert_eq!(all.len(), 2, "resources owned by other peers or local origin must survive");
    }

    #[tokio::test]
    async fn unchanged_specs_are_not_rewritten() {
        let store = Arc::new(InMemoryStore::new());
        let syncer = ResourceSyncer::new(store.clone());
        let prefilter = NamePrefilter::by_owner("zone-1");

        let created =
            store.create(dataplane("default", "backend.zone-1", "10.0.0.1")).await.unwrap();
        syncer
            .sync(
                ResourceType::Dataplane,
                vec![dataplane("default", "backend.zone-1", "10.0.0.1")],
                &prefilter,
            )
            .await
            .unwrap();

        let after = store.get(ResourceType::Dataplane, &created.key()).await.unwrap();
        assert_eq!(after.meta.version, created.meta.version, "no-op sync must not bump versions");
    }
}
