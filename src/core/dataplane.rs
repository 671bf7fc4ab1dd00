//! Dataplane and DataplaneInsight specs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::resource::{Tags, PROTOCOL_TAG, SERVICE_TAG};

/// Wire protocol declared on an inbound via the `protocol` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Http2,
    Grpc,
    Kafka,
    Tcp,
}

impl Protocol {
    /// Unknown values fall back to TCP.
    pub fn parse(s: &str) -> Protocol {
        match s {
            "http" => Protocol::Http,
            "http2" => Protocol::Http2,
            "grpc" => Protocol::Grpc,
            "kafka" => Protocol::Kafka,
            _ => Protocol::Tcp,
        }
    }

    pub fn is_http_based(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Http2 | Protocol::Grpc)
    }

    pub fn uses_http2_upstream(&self) -> bool {
        matches!(self, Protocol::Http2 | Protocol::Grpc)
    }
}

/// A sidecar-proxied workload registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataplaneSpec {
    pub networking: Networking,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Networking {
    /// Address on which the dataplane is reachable within the zone.
    pub address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbound: Vec<InboundInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound: Vec<OutboundInterface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Ingress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparent_proxying: Option<TransparentProxying>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundInterface {
    pub port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub tags: Tags,
}

impl InboundInterface {
    pub fn service(&self) -> Option<&str> {
        self.tags.get(SERVICE_TAG).map(String::as_str)
    }

    pub fn protocol(&self) -> Protocol {
        self.tags.get(PROTOCOL_TAG).map(|p| Protocol::parse(p)).unwrap_or(Protocol::Tcp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundInterface {
    pub port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub tags: Tags,
}

impl OutboundInterface {
    pub fn service(&self) -> Option<&str> {
        self.tags.get(SERVICE_TAG).map(String::as_str)
    }

    /// Outbounds bind on loopback unless an explicit address is set.
    pub fn listen_address(&self) -> &str {
        self.address.as_deref().unwrap_or("127.0.0.1")
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ingress {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_services: Vec<AvailableService>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableService {
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransparentProxying {
    #[serde(default)]
    pub redirect_port_inbound: u32,
    #[serde(default)]
    pub redirect_port_outbound: u32,
}

/// Resolved view of one inbound: where the sidecar listens and where the
/// local workload actually is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InboundEndpoint {
    pub dataplane_ip: String,
    pub dataplane_port: u32,
    pub workload_ip: String,
    pub workload_port: u32,
}

impl DataplaneSpec {
    /// Dataplanes with an `ingress` block are the inter-zone entrypoint of a
    /// zone; they have exactly one inbound.
    pub fn is_ingress(&self) -> bool {
        self.networking.ingress.is_some()
    }

    /// The `cluster` (zone of origin) tag from the first inbound.
    pub fn cluster_tag(&self) -> Option<&str> {
        self.networking
            .inbound
            .first()
            .and_then(|i| i.tags.get(crate::core::resource::CLUSTER_TAG))
            .map(String::as_str)
    }

    /// Resolve each inbound to concrete endpoints. The sidecar listens on the
    /// inbound address (falling back to the networking address); the workload
    /// is reached on loopback at `service_port` (falling back to `port`).
    pub fn inbound_endpoints(&self) -> Vec<InboundEndpoint> {
        self.networking
            .inbound
            .iter()
            .map(|inbound| InboundEndpoint {
                dataplane_ip: inbound
                    .address
                    .clone()
                    .unwrap_or_else(|| self.networking.address.clone()),
                dataplane_port: inbound.port,
                workload_ip: "127.0.0.1".to_string(),
                workload_port: inbound.service_port.unwrap_or(inbound.port),
            })
            .collect()
    }
}

/// Aggregated telemetry for a Dataplane.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataplaneInsightSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<DiscoverySubscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtls: Option<MtlsInsight>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySubscription {
    pub id: String,
    pub control_plane_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub responses_sent: u64,
    #[serde(default)]
    pub responses_acknowledged: u64,
    #[serde(default)]
    pub responses_rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtlsInsight {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_expiration_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_certificate_regeneration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub certificate_regenerations: u32,
}

impl DataplaneInsightSpec {
    /// The subscription with the greatest connect time.
    pub fn latest(&self) -> Option<&DiscoverySubscription> {
        self.subscriptions.iter().max_by_key(|s| s.connect_time)
    }

    /// A dataplane is online when its most recent subscription has not
    /// disconnected.
    pub fn online(&self) -> bool {
        self.latest().map(|s| s.disconnect_time.is_none()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn subscription(id: &str, connect: i64, disconnect: Option<i64>) -> DiscoverySubscription {
        DiscoverySubscription {
            id: id.to_string(),
            control_plane_instance_id: "cp-1".to_string(),
            connect_time: Some(Utc.timestamp_opt(connect, 0).unwrap()),
            disconnect_time: disconnect.map(|d| Utc.timestamp_opt(d, 0).unwrap()),
            status: SubscriptionStatus::default(),
        }
    }

    #[test]
    fn protocol_parsing_falls_back_to_tcp() {
        assert_eq!(Protocol::parse("http"), Protocol::Http);
        assert_eq!(Protocol::parse("grpc"), Protocol::Grpc);
        assert_eq!(Protocol::parse("mongo"), Protocol::Tcp);
        assert!(Protocol::Grpc.uses_http2_upstream());
        assert!(!Protocol::Http.uses_http2_upstream());
    }

    #[test]
    fn inbound_endpoints_resolve_addresses_and_ports() {
        let spec = DataplaneSpec {
            networking: Networking {
                address: "10.0.0.1".into(),
                inbound: vec![
                    InboundInterface {
                        port: 8080,
                        service_port: Some(9000),
                        address: None,
                        tags: tags(&[("service", "web")]),
                    },
                    InboundInterface {
                        port: 8081,
                        service_port: None,
                        address: Some("192.168.0.2".into()),
                        tags: tags(&[("service", "api")]),
                    },
                ],
                ..Default::default()
            },
        };
        let endpoints = spec.inbound_endpoints();
        assert_eq!(endpoints[0].dataplane_ip, "10.0.0.1");
        assert_eq!(endpoints[0].workload_port, 9000);
        assert_eq!(endpoints[1].dataplane_ip, "192.168.0.2");
        assert_eq!(endpoints[1].workload_port, 8081);
        assert_eq!(endpoints[1].workload_ip, "127.0.0.1");
    }

    #[test]
    fn insight_online_follows_latest_subscription() {
        let mut insight = DataplaneInsightSpec {
            subscriptions: vec![subscription("a", 100, Some(200)), subscription("b", 300, None)],
            mtls: None,
        };
        assert_eq!(insight.latest().unwrap().id, "b");
        assert!(insight.online());

        insight.subscriptions[1].disconnect_time = Some(Utc.timestamp_opt(400, 0).unwrap());
        assert!(!insight.online());

        let empty = DataplaneInsightSpec::default();
        assert!(!empty.online());
    }
}
