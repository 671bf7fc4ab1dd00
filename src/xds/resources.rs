//! Generated Envoy resources and their assembly into snapshots.

use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::cache::EnvoySnapshot;

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// Encode a protobuf message into `Any` under the given type URL.
pub fn pack_any<M: Message>(type_url: &str, message: &M) -> Any {
    Any { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

/// Kind of an emitted resource; decides which snapshot section it lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cluster,
    Endpoint,
    Listener,
    Route,
    Secret,
}

/// A single generated resource with the generator that produced it.
#[derive(Debug, Clone)]
pub struct XdsResource {
    pub name: String,
    pub kind: ResourceKind,
    pub origin: &'static str,
    pub resource: Any,
}

/// Accumulates generator output; later adds of the same (kind, name) replace
/// earlier ones.
#[derive(Debug, Default)]
pub struct ResourceSet {
    resources: Vec<XdsResource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, resource: XdsResource) {
        if let Some(existing) = self
            .resources
            .iter_mut()
            .find(|r| r.kind == resource.kind && r.name == resource.name)
        {
            *existing = resource;
        } else {
            self.resources.push(resource);
        }
    }

    pub fn extend(&mut self, other: ResourceSet) {
        for resource in other.resources {
            self.add(resource);
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &XdsResource> {
        self.resources.iter()
    }

    /// Assemble into a snapshot. Section maps are `BTreeMap`, so build order
    /// does not leak into the snapshot fingerprint.
    pub fn into_snapshot(self) -> EnvoySnapshot {
        let mut snapshot = EnvoySnapshot::default();
        for resource in self.resources {
            let section = match resource.kind {
                ResourceKind::Cluster => &mut snapshot.clusters,
                ResourceKind::Endpoint => &mut snapshot.endpoints,
                ResourceKind::Listener => &mut snapshot.listeners,
                ResourceKind::Route => &mut snapshot.routes,
                ResourceKind::Secret => &mut snapshot.secrets,
            };
            section.insert(resource.name, resource.resource);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;

    fn cluster_resource(name: &str, origin: &'static str) -> XdsResource {
        let cluster = Cluster { name: name.to_string(), ..Default::default() };
        XdsResource {
            name: name.to_string(),
            kind: ResourceKind::Cluster,
            origin,
            resource: pack_any(CLUSTER_TYPE_URL, &cluster),
        }
    }

    #[test]
    fn pack_any_round_trips() {
        let cluster = Cluster { name: "localhost:9000".into(), ..Default::default() };
        let any = pack_any(CLUSTER_TYPE_URL, &cluster);
        assert_eq!(any.type_url, CLUSTER_TYPE_URL);
        let decoded = Cluster::decode(any.value.as_slice()).unwrap();
        assert_eq!(decoded, cluster);
    }

    #[test]
    fn later_adds_replace_same_name_and_kind() {
        let mut set = ResourceSet::new();
        set.add(cluster_resource("web", "inbound"));
        set.add(cluster_resource("web", "outbound"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().origin, "outbound");
    }

    #[test]
    fn snapshot_sections_follow_resource_kind() {
        let mut set = ResourceSet::new();
        set.add(cluster_resource("a", "inbound"));
        set.add(cluster_resource("b", "inbound"));
        let snapshot = set.into_snapshot();
        assert_eq!(snapshot.clusters.len(), 2);
        assert!(snapshot.listeners.is_empty());
    }
}
