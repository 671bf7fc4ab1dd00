//! Zone side of the bus: provides the zone's own Dataplanes and insights,
//! consumes mesh-wide state (and foreign ingresses) from Global.

use std::sync::Arc;

use crate::config::GlobalPeerConfig;
use crate::core::resource::{Resource, ResourceType};
use crate::errors::Result;
use crate::kds::global::{SinkComponent, GLOBAL_NODE_ID};
use crate::kds::sink::{KdsSink, SyncCallbacks};
use crate::runtime::{Component, ResilientComponent};
use crate::store::{InMemoryStore, ResourceSyncer};

/// Types a Zone pushes up to Global.
pub const PROVIDED_TYPES: [ResourceType; 2] =
    [ResourceType::Dataplane, ResourceType::DataplaneInsight];

/// Types a Zone pulls down from Global.
pub const CONSUMED_TYPES: [ResourceType; 11] = crate::kds::global::PROVIDED_TYPES;

/// Outgoing filter: only resources of local origin go up. Anything synced
/// down from Global carries its `.global` origin marker (plus the namespace
/// suffix on Kubernetes stores) and must not bounce back.
pub fn provided_filter(_peer: &str, resource: &Resource) -> bool {
    let name = &resource.meta.name;
    let trimmed = name.strip_suffix(".default").unwrap_or(name);
    !trimmed.ends_with(&format!(".{}", GLOBAL_NODE_ID))
}

/// The sink pulling Global state into this zone, wrapped in a supervisor.
pub fn global_sink(
    store: Arc<InMemoryStore>,
    k8s_store: bool,
    zone_name: &str,
    global: &GlobalPeerConfig,
) -> Result<Arc<dyn Component>> {
    let callbacks = SyncCallbacks::new(ResourceSyncer::new(store), k8s_store, None);
    let sink = KdsSink::new(
        zone_name.to_string(),
        GLOBAL_NODE_ID.to_string(),
        global.address.clone(),
        CONSUMED_TYPES.to_vec(),
        Arc::new(callbacks),
    );
    Ok(Arc::new(ResilientComponent::new(Arc::new(SinkComponent {
        name: "kds-sink-global".to_string(),
        sink,
    }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataplane::{DataplaneSpec, Networking};
    use crate::core::resource::ResourceSpec;

    fn dataplane(name: &str) -> Resource {
        Resource::new(
            "default",
            name,
            ResourceSpec::Dataplane(DataplaneSpec {
                networking: Networking { address: "10.0.0.1".into(), ..Default::default() },
            }),
        )
    }

    #[test]
    fn synced_resources_never_bounce_back() {
        assert!(provided_filter("global", &dataplane("backend")));
        assert!(provided_filter("global", &dataplane("backend.zone-2")));
        assert!(!provided_filter("global", &dataplane("ingress-b.global")));
        assert!(!provided_filter("global", &dataplane("ingress-b.global.default")));
    }
}
