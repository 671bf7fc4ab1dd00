//! Typed resources and their identities.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::dataplane::{DataplaneInsightSpec, DataplaneSpec};
use crate::core::mesh::MeshSpec;
use crate::core::policy::{
    CircuitBreakerSpec, FaultInjectionSpec, HealthCheckSpec, RateLimitSpec, SecretSpec,
    TrafficLogSpec, TrafficPermissionSpec, TrafficRouteSpec, TrafficTraceSpec,
};
use crate::errors::{Error, Result};

/// Tag maps keep a stable order; `service` is the distinguished key.
pub type Tags = BTreeMap<String, String>;

/// The tag carrying the service name of an inbound/outbound.
pub const SERVICE_TAG: &str = "service";

/// The tag carrying the inbound protocol.
pub const PROTOCOL_TAG: &str = "protocol";

/// The tag stamped on resources with their zone of origin.
pub const CLUSTER_TAG: &str = "cluster";

/// All resource types known to the control plane. Read-only after init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Mesh,
    Dataplane,
    DataplaneInsight,
    TrafficPermission,
    TrafficRoute,
    TrafficLog,
    TrafficTrace,
    FaultInjection,
    HealthCheck,
    CircuitBreaker,
    RateLimit,
    Secret,
}

impl ResourceType {
    /// Every type, in a fixed order.
    pub const ALL: [ResourceType; 12] = [
        ResourceType::Mesh,
        ResourceType::Dataplane,
        ResourceType::DataplaneInsight,
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

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Mesh => "Mesh",
            ResourceType::Dataplane => "Dataplane",
            ResourceType::DataplaneInsight => "DataplaneInsight",
            ResourceType::TrafficPermission => "TrafficPermission",
            ResourceType::TrafficRoute => "TrafficRoute",
            ResourceType::TrafficLog => "TrafficLog",
            ResourceType::TrafficTrace => "TrafficTrace",
            ResourceType::FaultInjection => "FaultInjection",
            ResourceType::HealthCheck => "HealthCheck",
            ResourceType::CircuitBreaker => "CircuitBreaker",
            ResourceType::RateLimit => "RateLimit",
            ResourceType::Secret => "Secret",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ResourceType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| Error::protocol(format!("unknown resource type '{}'", s)))
    }
}

/// Identity of a resource within a type: `(mesh, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub mesh: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new<M: Into<String>, N: Into<String>>(mesh: M, name: N) -> Self {
        Self { mesh: mesh.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mesh, self.name)
    }
}

/// Metadata shared by every resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub resource_type: ResourceType,
    pub mesh: String,
    pub name: String,
    /// Optimistic concurrency version; bumped by the store on every write.
    pub version: u64,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

impl ResourceMeta {
    pub fn new(resource_type: ResourceType, mesh: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            resource_type,
            mesh: mesh.to_string(),
            name: name.to_string(),
            version: 0,
            creation_time: now,
            modification_time: now,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.mesh.clone(), self.name.clone())
    }
}

/// Typed spec of a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Mesh(MeshSpec),
    Dataplane(DataplaneSpec),
    DataplaneInsight(DataplaneInsightSpec),
    TrafficPermission(TrafficPermissionSpec),
    TrafficRoute(TrafficRouteSpec),
    TrafficLog(TrafficLogSpec),
    TrafficTrace(TrafficTraceSpec),
    FaultInjection(FaultInjectionSpec),
    HealthCheck(HealthCheckSpec),
    CircuitBreaker(CircuitBreakerSpec),
    RateLimit(RateLimitSpec),
    Secret(SecretSpec),
}

impl ResourceSpec {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceSpec::Mesh(_) => ResourceType::Mesh,
            ResourceSpec::Dataplane(_) => ResourceType::Dataplane,
            ResourceSpec::DataplaneInsight(_) => ResourceType::DataplaneInsight,
            ResourceSpec::TrafficPermission(_) => ResourceType::TrafficPermission,
            ResourceSpec::TrafficRoute(_) => ResourceType::TrafficRoute,
            ResourceSpec::TrafficLog(_) => ResourceType::TrafficLog,
            ResourceSpec::TrafficTrace(_) => ResourceType::TrafficTrace,
            ResourceSpec::FaultInjection(_) => ResourceType::FaultInjection,
            ResourceSpec::HealthCheck(_) => ResourceType::HealthCheck,
            ResourceSpec::CircuitBreaker(_) => ResourceType::CircuitBreaker,
            ResourceSpec::RateLimit(_) => ResourceType::RateLimit,
            ResourceSpec::Secret(_) => ResourceType::Secret,
        }
    }

    /// Canonical JSON serialization of the spec body. Struct field order is
    /// fixed and tag maps are `BTreeMap`, so equal specs yield equal bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            ResourceSpec::Mesh(s) => serde_json::to_vec(s)?,
            ResourceSpec::Dataplane(s) => serde_json::to_vec(s)?,
            ResourceSpec::DataplaneInsight(s) => serde_json::to_vec(s)?,
            ResourceSpec::TrafficPermission(s) => serde_json::to_vec(s)?,
            ResourceSpec::TrafficRoute(s) => serde_json::to_vec(s)?,
            ResourceSpec::TrafficLog(s) => serde_json::to_vec(s)?,
            ResourceSpec::TrafficTrace(s) => serde_json::to_vec(s)?,
            ResourceSpec::FaultInjection(s) => serde_json::to_vec(s)?,
            ResourceSpec::HealthCheck(s) => serde_json::to_vec(s)?,
            ResourceSpec::CircuitBreaker(s) => serde_json::to_vec(s)?,
            ResourceSpec::RateLimit(s) => serde_json::to_vec(s)?,
            ResourceSpec::Secret(s) => serde_json::to_vec(s)?,
        };
        Ok(bytes)
    }

    /// Decode a spec body for a known resource type.
    pub fn from_json(resource_type: ResourceType, bytes: &[u8]) -> Result<Self> {
        let spec = match resource_type {
            ResourceType::Mesh => ResourceSpec::Mesh(serde_json::from_slice(bytes)?),
            ResourceType::Dataplane => ResourceSpec::Dataplane(serde_json::from_slice(bytes)?),
            ResourceType::DataplaneInsight => {
                ResourceSpec::DataplaneInsight(serde_json::from_slice(bytes)?)
            }
            ResourceType::TrafficPermission => {
                ResourceSpec::TrafficPermission(serde_json::from_slice(bytes)?)
            }
            ResourceType::TrafficRoute => {
                ResourceSpec::TrafficRoute(serde_json::from_slice(bytes)?)
            }
            ResourceType::TrafficLog => ResourceSpec::TrafficLog(serde_json::from_slice(bytes)?),
            ResourceType::TrafficTrace => {
                ResourceSpec::TrafficTrace(serde_json::from_slice(bytes)?)
            }
            ResourceType::FaultInjection => {
                ResourceSpec::FaultInjection(serde_json::from_slice(bytes)?)
            }
            ResourceType::HealthCheck => ResourceSpec::HealthCheck(serde_json::from_slice(bytes)?),
            ResourceType::CircuitBreaker => {
                ResourceSpec::CircuitBreaker(serde_json::from_slice(bytes)?)
            }
            ResourceType::RateLimit => ResourceSpec::RateLimit(serde_json::from_slice(bytes)?),
            ResourceType::Secret => ResourceSpec::Secret(serde_json::from_slice(bytes)?),
        };
        Ok(spec)
    }
}

/// A named, versioned resource in a mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub meta: ResourceMeta,
    pub spec: ResourceSpec,
}

impl Resource {
    pub fn new(mesh: &str, name: &str, spec: ResourceSpec) -> Self {
        Self { meta: ResourceMeta::new(spec.resource_type(), mesh, name), spec }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.meta.resource_type
    }

    pub fn key(&self) -> ResourceKey {
        self.meta.key()
    }

    pub fn as_dataplane(&self) -> Result<&DataplaneSpec> {
        match &self.spec {
            ResourceSpec::Dataplane(dp) => Ok(dp),
            other => Err(Error::internal(format!(
                "expected Dataplane spec, got {}",
                other.resource_type()
            ))),
        }
    }

    pub fn as_mesh(&self) -> Result<&MeshSpec> {
        match &self.spec {
            ResourceSpec::Mesh(m) => Ok(m),
            other => {
                Err(Error::internal(format!("expected Mesh spec, got {}", other.resource_type())))
            }
        }
    }

    /// The zone-of-origin tag of a Dataplane, taken from its first inbound.
    pub fn cluster_tag(&self) -> Option<&str> {
        match &self.spec {
            ResourceSpec::Dataplane(dp) => dp.cluster_tag(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataplane::{InboundInterface, Networking};

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn resource_type_round_trips_through_str() {
        for t in ResourceType::ALL {
            assert_eq!(t.as_str().parse::<ResourceType>().unwrap(), t);
        }
        assert!("Gateway".parse::<ResourceType>().is_err());
    }

    #[test]
    fn spec_json_round_trip_is_stable() {
        let spec = ResourceSpec::Dataplane(DataplaneSpec {
            networking: Networking {
                address: "10.0.0.1".into(),
                inbound: vec![InboundInterface {
                    port: 8080,
                    service_port: Some(9000),
                    address: None,
                    tags: tags(&[("service", "web"), ("protocol", "http")]),
                }],
                ..Default::default()
            },
        });
        let first = spec.to_json().unwrap();
        let decoded = ResourceSpec::from_json(ResourceType::Dataplane, &first).unwrap();
        assert_eq!(decoded, spec);
        assert_eq!(decoded.to_json().unwrap(), first);
    }
}
