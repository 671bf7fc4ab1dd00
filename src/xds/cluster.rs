//! Cluster builders.

use envoy_types::pb::envoy::config::cluster::v3::{
    circuit_breakers, cluster, CircuitBreakers, Cluster,
};
use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, config_source::ConfigSourceSpecifier, health_check,
    socket_address::PortSpecifier, transport_socket::ConfigType as TransportSocketConfigType,
    Address, AggregatedConfigSource, ApiVersion, ConfigSource, HealthCheck, Http2ProtocolOptions,
    Locality, SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::UpstreamTlsContext;
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options, HttpProtocolOptions,
};
use envoy_types::pb::google::protobuf::{Any, Duration, UInt32Value};
use prost::Message;

use crate::core::policy::{CircuitBreakerConf, HealthCheckConf};
use crate::errors::Result;

/// Well-known extension key for upstream HTTP protocol options.
pub const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

const UPSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

const CONNECT_TIMEOUT_SECONDS: i64 = 5;

fn socket_address(address: &str, port: u32) -> Address {
    Address {
        address: Some(AddressType::SocketAddress(SocketAddress {
            address: address.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

fn lb_endpoint(address: &str, port: u32) -> LbEndpoint {
    LbEndpoint {
        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
            address: Some(socket_address(address, port)),
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// STATIC cluster with a single endpoint; used for the local workload behind
/// an inbound.
pub fn static_cluster(name: &str, address: &str, port: u32) -> Cluster {
    Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Static as i32,
        )),
        connect_timeout: Some(Duration { seconds: CONNECT_TIMEOUT_SECONDS, nanos: 0 }),
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![lb_endpoint(address, port)],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// STRICT_DNS cluster toward an out-of-mesh collector (tracing backends).
pub fn strict_dns_cluster(name: &str, host: &str, port: u32) -> Cluster {
    Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::StrictDns as i32,
        )),
        connect_timeout: Some(Duration { seconds: CONNECT_TIMEOUT_SECONDS, nanos: 0 }),
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![lb_endpoint(host, port)],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// TLS transport socket carrying the upstream mTLS context.
pub fn upstream_tls_transport(tls_context: &UpstreamTlsContext) -> TransportSocket {
    TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(Any {
            type_url: UPSTREAM_TLS_TYPE_URL.to_string(),
            value: tls_context.encode_to_vec(),
        })),
    }
}

/// EDS cluster resolved through the ADS stream; used for outbound services.
pub fn eds_cluster(name: &str) -> Cluster {
    Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Eds as i32,
        )),
        connect_timeout: Some(Duration { seconds: CONNECT_TIMEOUT_SECONDS, nanos: 0 }),
        eds_cluster_config: Some(cluster::EdsClusterConfig {
            eds_config: Some(ConfigSource {
                resource_api_version: ApiVersion::V3 as i32,
                config_source_specifier: Some(ConfigSourceSpecifier::Ads(
                    AggregatedConfigSource {},
                )),
                ..Default::default()
            }),
            service_name: String::new(),
        }),
        ..Default::default()
    }
}

/// A resolved upstream endpoint with its locality zone.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub address: String,
    pub port: u32,
    pub zone: String,
}

/// Load assignment for an EDS cluster. With locality-aware LB, endpoints are
/// grouped by zone and remote zones get a lower priority; otherwise a single
/// locality holds everything.
pub fn cluster_load_assignment(
    cluster_name: &str,
    endpoints: &[ResolvedEndpoint],
    locality_aware: bool,
    local_zone: &str,
) -> ClusterLoadAssignment {
    let localities = if locality_aware {
        let mut zones: Vec<&str> = endpoints.iter().map(|e| e.zone.as_str()).collect();
        zones.sort_unstable();
        zones.dedup();
        zones
            .into_iter()
            .map(|zone| LocalityLbEndpoints {
                locality: Some(Locality { zone: zone.to_string(), ..Default::default() }),
                priority: if zone == local_zone { 0 } else { 1 },
                lb_endpoints: endpoints
                    .iter()
                    .filter(|e| e.zone == zone)
                    .map(|e| lb_endpoint(&e.address, e.port))
                    .collect(),
                ..Default::default()
            })
            .collect()
    } else {
        vec![LocalityLbEndpoints {
            lb_endpoints: endpoints.iter().map(|e| lb_endpoint(&e.address, e.port)).collect(),
            ..Default::default()
        }]
    };
    ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: localities,
        ..Default::default()
    }
}

/// Read-modify-write of the upstream HTTP protocol options stored under the
/// well-known extension key: unmarshal if present, mutate, re-marshal.
pub fn update_common_http_protocol_options<F>(cluster: &mut Cluster, mutate: F) -> Result<()>
where
    F: FnOnce(&mut HttpProtocolOptions),
{
    let mut options = match cluster.typed_extension_protocol_options.get(HTTP_PROTOCOL_OPTIONS_KEY)
    {
        Some(existing) => HttpProtocolOptions::decode(existing.value.as_slice())?,
        None => HttpProtocolOptions::default(),
    };

    mutate(&mut options);

    cluster.typed_extension_protocol_options.insert(
        HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
        Any {
            type_url: HTTP_PROTOCOL_OPTIONS_TYPE_URL.to_string(),
            value: options.encode_to_vec(),
        },
    );
    Ok(())
}

/// Force HTTP/2 toward the upstream (http2 and gRPC inbounds).
pub fn configure_http2(cluster: &mut Cluster) -> Result<()> {
    update_common_http_protocol_options(cluster, |options| {
        options.upstream_protocol_options =
            Some(http_protocol_options::UpstreamProtocolOptions::ExplicitHttpConfig(
                http_protocol_options::ExplicitHttpConfig {
                    protocol_config: Some(
                        http_protocol_options::explicit_http_config::ProtocolConfig::Http2ProtocolOptions(
                            Http2ProtocolOptions::default(),
                        ),
                    ),
                },
            ));
    })
}

/// Apply a matched HealthCheck policy as a TCP health check.
pub fn configure_health_check(cluster: &mut Cluster, conf: &HealthCheckConf) {
    cluster.health_checks.push(HealthCheck {
        interval: Some(millis(conf.interval_ms)),
        timeout: Some(millis(conf.timeout_ms)),
        unhealthy_threshold: Some(UInt32Value { value: conf.unhealthy_threshold }),
        healthy_threshold: Some(UInt32Value { value: conf.healthy_threshold }),
        health_checker: Some(health_check::HealthChecker::TcpHealthCheck(
            health_check::TcpHealthCheck::default(),
        )),
        ..Default::default()
    });
}

/// Apply a matched CircuitBreaker policy as default-priority thresholds.
pub fn configure_circuit_breaker(cluster: &mut Cluster, conf: &CircuitBreakerConf) {
    cluster.circuit_breakers = Some(CircuitBreakers {
        thresholds: vec![circuit_breakers::Thresholds {
            max_connections: conf.max_connections.map(|v| UInt32Value { value: v }),
            max_pending_requests: conf.max_pending_requests.map(|v| UInt32Value { value: v }),
            max_requests: conf.max_requests.map(|v| UInt32Value { value: v }),
            max_retries: conf.max_retries.map(|v| UInt32Value { value: v }),
            ..Default::default()
        }],
        ..Default::default()
    });
}

fn millis(ms: u64) -> Duration {
    Duration { seconds: (ms / 1000) as i64, nanos: ((ms % 1000) * 1_000_000) as i32 }
}
