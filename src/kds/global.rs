//! Global side of the bus: provides mesh-wide policy and (foreign) ingress
//! dataplanes, consumes each zone's Dataplanes and insights.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ZonePeerConfig;
use crate::core::resource::{Resource, ResourceSpec, ResourceType};
use crate::errors::Result;
use crate::kds::rewrite::parse_ingress_address;
use crate::kds::sink::{KdsSink, SyncCallbacks};
use crate::runtime::{Component, ResilientComponent};
use crate::store::{InMemoryStore, ResourceSyncer};

/// Node id the Global control plane presents to zones.
pub const GLOBAL_NODE_ID: &str = "global";

/// Types Global pushes down to zones.
pub const PROVIDED_TYPES: [ResourceType; 11] = [
    ResourceType::Mesh,
    ResourceType::Dataplane,
    ResourceType::TrafficPermission,
    ResourceType::TrafficRoute,
    ResourceType::TrafficLog,
    ResourceType::TrafficTrace,
    ResourceType::FaultInjection,
    ResourceType::HealthCheck,
    ResourceType::CircuitBreaker,
    ResourceType::RateLimit,
    ResourceType::Secret,
];

/// Types Global pulls up from every zone.
pub const CONSUMED_TYPES: [ResourceType; 2] =
    [ResourceType::Dataplane, ResourceType::DataplaneInsight];

/// Outgoing filter: non-Dataplane resources flow freely; Dataplanes are
/// reduced to Ingress Dataplanes of *other* zones, so a zone receives every
/// peer's ingress but never its own, and never plain workloads.
pub fn provided_filter(peer: &str, resource: &Resource) -> bool {
    let ResourceSpec::Dataplane(dataplane) = &resource.spec else {
        return true;
    };
    if !dataplane.is_ingress() {
        return false;
    }
    dataplane.cluster_tag() != Some(peer)
}

/// One sink per configured zone, each wrapped in a supervisor.
pub fn zone_sinks(
    store: Arc<InMemoryStore>,
    k8s_store: bool,
    zones: &[ZonePeerConfig],
) -> Result<Vec<Arc<dyn Component>>> {
    let mut components: Vec<Arc<dyn Component>> = Vec::with_capacity(zones.len());
    for zone in zones {
        let ingress_address = parse_ingress_address(&zone.ingress.address)?;
        let callbacks = SyncCallbacks::new(
            ResourceSyncer::new(store.clone()),
            k8s_store,
            Some(ingress_address),
        );
        let sink = KdsSink::new(
            GLOBAL_NODE_ID.to_string(),
            zone.name.clone(),
            zone.remote.address.clone(),
            CONSUMED_TYPES.to_vec(),
            Arc::new(callbacks),
        );
        components.push(Arc::new(ResilientComponent::new(Arc::new(SinkComponent {
            name: format!("kds-sink-{}", zone.name),
            sink,
        }))));
    }
    Ok(components)
}

pub(crate) struct SinkComponent {
    pub(crate) name: String,
    pub(crate) sink: KdsSink,
}

#[async_trait]
impl Component for SinkComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, stop: CancellationToken) -> Result<()> {
        self.sink.run(stop).await;
        Ok(())
    }
}
