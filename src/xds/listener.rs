//! Listener and filter chain builders.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::accesslog::v3::{access_log, AccessLog};
use envoy_types::pb::envoy::config::core::v3::TrafficDirection;
use envoy_types::pb::envoy::config::listener::v3::{
    filter::ConfigType as FilterConfigType, listener_filter::ConfigType as ListenerFilterConfigType,
    Filter, FilterChain, Listener, ListenerFilter,
};
use envoy_types::pb::envoy::config::rbac::v3 as rbac_config;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::config::trace::v3 as trace;
use envoy_types::pb::envoy::extensions::access_loggers::file::v3::{
    file_access_log, FileAccessLog,
};
use envoy_types::pb::envoy::extensions::filters::common::fault::v3::{fault_delay, FaultDelay};
use envoy_types::pb::envoy::extensions::filters::http::fault::v3::{fault_abort, FaultAbort, HttpFault};
use envoy_types::pb::envoy::extensions::filters::http::grpc_stats::v3::{
    filter_config as grpc_stats_config, FilterConfig as GrpcStatsConfig,
};
use envoy_types::pb::envoy::extensions::filters::http::local_ratelimit::v3::LocalRateLimit;
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::listener::original_dst::v3::OriginalDst;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter,
};
use envoy_types::pb::envoy::extensions::filters::network::rbac::v3::Rbac as NetworkRbac;
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{tcp_proxy, TcpProxy};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::DownstreamTlsContext;
use envoy_types::pb::envoy::r#type::v3::{
    fractional_percent::DenominatorType, FractionalPercent, Percent,
};
use envoy_types::pb::envoy::config::core::v3::{
    transport_socket::ConfigType as TransportSocketConfigType, Address, SocketAddress,
    TransportSocket,
};
use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, socket_address::PortSpecifier,
};
use envoy_types::pb::google::protobuf::{BoolValue, Duration};

use crate::core::mesh::TracingBackend;
use crate::core::policy::{FaultInjectionConf, TrafficLogConf};
use crate::errors::{Error, Result};
use crate::xds::matcher::MatchedPermission;
use crate::xds::names::sanitize_stat_name;
use crate::xds::resources::pack_any;
use crate::xds::tls;

pub const HTTP_CONNECTION_MANAGER_FILTER: &str = "envoy.filters.network.http_connection_manager";
pub const TCP_PROXY_FILTER: &str = "envoy.filters.network.tcp_proxy";
pub const NETWORK_RBAC_FILTER: &str = "envoy.filters.network.rbac";
pub const KAFKA_BROKER_FILTER: &str = "envoy.filters.network.kafka_broker";
pub const HTTP_FAULT_FILTER: &str = "envoy.filters.http.fault";
pub const HTTP_LOCAL_RATE_LIMIT_FILTER: &str = "envoy.filters.http.local_ratelimit";
pub const HTTP_GRPC_STATS_FILTER: &str = "envoy.filters.http.grpc_stats";
pub const HTTP_ROUTER_FILTER: &str = "envoy.filters.http.router";
pub const ORIGINAL_DST_LISTENER_FILTER: &str = "envoy.filters.listener.original_dst";
pub const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";
pub const FILE_ACCESS_LOG: &str = "envoy.access_loggers.file";

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const NETWORK_RBAC_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.rbac.v3.RBAC";
const KAFKA_BROKER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.kafka_broker.v3.KafkaBroker";
const HTTP_FAULT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.fault.v3.HTTPFault";
const LOCAL_RATE_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.local_ratelimit.v3.LocalRateLimit";
const GRPC_STATS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.grpc_stats.v3.FilterConfig";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const ORIGINAL_DST_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.original_dst.v3.OriginalDst";
const DOWNSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
const FILE_ACCESS_LOG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.file.v3.FileAccessLog";
const ZIPKIN_TYPE_URL: &str = "type.googleapis.com/envoy.config.trace.v3.ZipkinConfig";

/// Kafka broker network filter config. The proto lives in Envoy's contrib
/// tree, outside the envoy-types coverage, so it is derived here with the
/// upstream field numbering.
#[derive(Clone, PartialEq, ::prost::Message)]
struct KafkaBroker {
    #[prost(string, tag = "1")]
    stat_prefix: String,
}

fn socket_address(address: &str, port: u32) -> Address {
    Address {
        address: Some(AddressType::SocketAddress(SocketAddress {
            address: address.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

fn percent(value: f64) -> FractionalPercent {
    FractionalPercent { numerator: value.round() as u32, denominator: DenominatorType::Hundred as i32 }
}

/// An HTTP filter chain under assembly; filters are appended in order and
/// the router is always closed off last.
#[derive(Default)]
pub struct HttpFilterChain {
    filters: Vec<HttpFilter>,
    tracing: Option<http_connection_manager::Tracing>,
    access_logs: Vec<AccessLog>,
}

impl HttpFilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// FaultInjection, translated from the most specific matched policy.
    pub fn with_fault_injection(mut self, conf: Option<&FaultInjectionConf>) -> Self {
        let Some(conf) = conf else { return self };
        let fault = HttpFault {
            delay: conf.delay.as_ref().map(|d| FaultDelay {
                percentage: Some(percent(d.percentage)),
                fault_delay_secifier: Some(fault_delay::FaultDelaySecifier::FixedDelay(Duration {
                    seconds: (d.value_ms / 1000) as i64,
                    nanos: ((d.value_ms % 1000) * 1_000_000) as i32,
                })),
                ..Default::default()
            }),
            abort: conf.abort.as_ref().map(|a| FaultAbort {
                percentage: Some(percent(a.percentage)),
                error_type: Some(fault_abort::ErrorType::HttpStatus(a.http_status)),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.filters.push(HttpFilter {
            name: HTTP_FAULT_FILTER.to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(pack_any(HTTP_FAULT_TYPE_URL, &fault))),
            ..Default::default()
        });
        self
    }

    /// LocalRateLimit stage: an empty filter-level config that per-route
    /// configs activate.
    pub fn with_rate_limit(mut self, has_rate_limits: bool) -> Self {
        if !has_rate_limits {
            return self;
        }
        let config = LocalRateLimit { stat_prefix: "rate_limit".to_string(), ..Default::default() };
        self.filters.push(HttpFilter {
            name: HTTP_LOCAL_RATE_LIMIT_FILTER.to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(pack_any(
                LOCAL_RATE_LIMIT_TYPE_URL,
                &config,
            ))),
            ..Default::default()
        });
        self
    }

    pub fn with_grpc_stats(mut self) -> Self {
        let config = GrpcStatsConfig {
            emit_filter_state: true,
            per_method_stat_specifier: Some(
                grpc_stats_config::PerMethodStatSpecifier::StatsForAllMethods(BoolValue {
                    value: true,
                }),
            ),
            ..Default::default()
        };
        self.filters.push(HttpFilter {
            name: HTTP_GRPC_STATS_FILTER.to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(pack_any(
                GRPC_STATS_TYPE_URL,
                &config,
            ))),
            ..Default::default()
        });
        self
    }

    /// Tracing toward a mesh backend; the caller emits the matching
    /// collector cluster.
    pub fn with_tracing(mut self, backend: Option<&TracingBackend>) -> Result<Self> {
        let Some(backend) = backend else { return Ok(self) };
        let Some(zipkin) = &backend.zipkin else { return Ok(self) };

        let (_, _, path) = parse_collector_url(&zipkin.url)?;
        let config = trace::ZipkinConfig {
            collector_cluster: tracing_cluster_name(&backend.name),
            collector_endpoint: path,
            collector_endpoint_version: trace::zipkin_config::CollectorEndpointVersion::HttpJson
                as i32,
            shared_span_context: Some(BoolValue { value: false }),
            ..Default::default()
        };
        self.tracing = Some(http_connection_manager::Tracing {
            overall_sampling: Some(Percent { value: backend.sampling.unwrap_or(100.0) }),
            provider: Some(trace::tracing::Http {
                name: "envoy.tracers.zipkin".to_string(),
                config_type: Some(trace::tracing::http::ConfigType::TypedConfig(pack_any(
                    ZIPKIN_TYPE_URL,
                    &config,
                ))),
            }),
            ..Default::default()
        });
        Ok(self)
    }

    /// File access log from a matched TrafficLog policy.
    pub fn with_access_log(mut self, conf: Option<&TrafficLogConf>) -> Self {
        if let Some(conf) = conf {
            self.access_logs.push(file_access_log(conf));
        }
        self
    }

    /// Close off with the router filter and an inline route config.
    pub fn build(mut self, stat_prefix: &str, route_config: RouteConfiguration) -> Filter {
        self.filters.push(HttpFilter {
            name: HTTP_ROUTER_FILTER.to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(pack_any(
                ROUTER_TYPE_URL,
                &Router::default(),
            ))),
            ..Default::default()
        });
        let hcm = HttpConnectionManager {
            stat_prefix: sanitize_stat_name(stat_prefix),
            route_specifier: Some(http_connection_manager::RouteSpecifier::RouteConfig(
                route_config,
            )),
            http_filters: self.filters,
            tracing: self.tracing,
            access_log: self.access_logs,
            ..Default::default()
        };
        Filter {
            name: HTTP_CONNECTION_MANAGER_FILTER.to_string(),
            config_type: Some(FilterConfigType::TypedConfig(pack_any(HCM_TYPE_URL, &hcm))),
            ..Default::default()
        }
    }
}

fn file_access_log(conf: &TrafficLogConf) -> AccessLog {
    let config = FileAccessLog {
        path: conf.path.clone(),
        access_log_format: conf
            .format
            .clone()
            .map(file_access_log::AccessLogFormat::Format),
    };
    AccessLog {
        name: FILE_ACCESS_LOG.to_string(),
        config_type: Some(access_log::ConfigType::TypedConfig(pack_any(
            FILE_ACCESS_LOG_TYPE_URL,
            &config,
        ))),
        ..Default::default()
    }
}

/// Name of the collector cluster emitted alongside a traced listener.
pub fn tracing_cluster_name(backend: &str) -> String {
    format!("tracing:{}", backend)
}

/// Split a collector URL into (host, port, path). Only the http scheme with
/// an explicit or default port is accepted.
pub fn parse_collector_url(url: &str) -> Result<(String, u32, String)> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| Error::invalid_resource(format!("unsupported collector url '{}'", url)))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u32>().map_err(|_| {
                Error::invalid_resource(format!("invalid collector port in '{}'", url))
            })?;
            (host.to_string(), port)
        }
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        return Err(Error::invalid_resource(format!("empty collector host in '{}'", url)));
    }
    Ok((host, port, path))
}

/// Plain TCP proxy to one cluster.
pub fn tcp_proxy_filter(stat_prefix: &str, cluster: &str) -> Filter {
    tcp_proxy_filter_with_log(stat_prefix, cluster, None)
}

/// TCP proxy to one cluster, logging per a matched TrafficLog.
pub fn tcp_proxy_filter_with_log(
    stat_prefix: &str,
    cluster: &str,
    log: Option<&TrafficLogConf>,
) -> Filter {
    let proxy = TcpProxy {
        stat_prefix: sanitize_stat_name(stat_prefix),
        cluster_specifier: Some(tcp_proxy::ClusterSpecifier::Cluster(cluster.to_string())),
        access_log: log.map(|conf| vec![file_access_log(conf)]).unwrap_or_default(),
        ..Default::default()
    };
    Filter {
        name: TCP_PROXY_FILTER.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(pack_any(TCP_PROXY_TYPE_URL, &proxy))),
        ..Default::default()
    }
}

/// TCP proxy splitting across weighted clusters.
pub fn tcp_proxy_weighted_filter(
    stat_prefix: &str,
    clusters: &[(String, u32)],
    log: Option<&TrafficLogConf>,
) -> Filter {
    let proxy = TcpProxy {
        stat_prefix: sanitize_stat_name(stat_prefix),
        cluster_specifier: Some(tcp_proxy::ClusterSpecifier::WeightedClusters(
            tcp_proxy::WeightedCluster {
                clusters: clusters
                    .iter()
                    .map(|(name, weight)| tcp_proxy::weighted_cluster::ClusterWeight {
                        name: name.clone(),
                        weight: *weight,
                        ..Default::default()
                    })
                    .collect(),
            },
        )),
        access_log: log.map(|conf| vec![file_access_log(conf)]).unwrap_or_default(),
        ..Default::default()
    };
    Filter {
        name: TCP_PROXY_FILTER.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(pack_any(TCP_PROXY_TYPE_URL, &proxy))),
        ..Default::default()
    }
}

/// Kafka broker metadata filter; sits in front of the TCP proxy.
pub fn kafka_broker_filter(stat_prefix: &str) -> Filter {
    let config = KafkaBroker { stat_prefix: sanitize_stat_name(stat_prefix) };
    Filter {
        name: KAFKA_BROKER_FILTER.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(pack_any(KAFKA_BROKER_TYPE_URL, &config))),
        ..Default::default()
    }
}

/// Network RBAC from the matched TrafficPermissions. Only emitted when mTLS
/// is on (identities are unverifiable otherwise). With no matched
/// permissions the ALLOW ruleset is empty, which denies everything.
///
/// A single policy entry (keyed by the listener name) carries the union of
/// principals in match order; multi-entry protobuf maps have no stable
/// encode order.
pub fn network_rbac_filter(
    listener_name: &str,
    mesh: &str,
    mtls_enabled: bool,
    permissions: &[MatchedPermission],
) -> Option<Filter> {
    if !mtls_enabled {
        return None;
    }

    let mut principals = Vec::new();
    for permission in permissions {
        for source in &permission.spec.sources {
            let matcher = match source.match_tags.get(crate::core::resource::SERVICE_TAG) {
                Some(service) if service != "*" => tls::service_spiffe_id_matcher(mesh, service),
                _ => tls::mesh_spiffe_id_prefix_matcher(mesh),
            };
            principals.push(rbac_config::Principal {
                identifier: Some(rbac_config::principal::Identifier::Authenticated(
                    rbac_config::principal::Authenticated {
                        principal_name: Some(matcher),
                        ..Default::default()
                    },
                )),
            });
        }
    }

    let mut policies = HashMap::new();
    if !principals.is_empty() {
        policies.insert(
            listener_name.to_string(),
            rbac_config::Policy {
                permissions: vec![rbac_config::Permission {
                    rule: Some(rbac_config::permission::Rule::Any(true)),
                }],
                principals,
                ..Default::default()
            },
        );
    }

    let rbac = NetworkRbac {
        stat_prefix: sanitize_stat_name(&format!("rbac_{}", listener_name)),
        rules: Some(rbac_config::Rbac {
            action: rbac_config::rbac::Action::Allow as i32,
            policies,
            ..Default::default()
        }),
        ..Default::default()
    };
    Some(Filter {
        name: NETWORK_RBAC_FILTER.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(pack_any(NETWORK_RBAC_TYPE_URL, &rbac))),
        ..Default::default()
    })
}

/// TLS transport socket for the inbound filter chain.
pub fn server_side_mtls_transport(tls_context: &DownstreamTlsContext) -> TransportSocket {
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(pack_any(
            DOWNSTREAM_TLS_TYPE_URL,
            tls_context,
        ))),
    }
}

/// Inbound listener on the dataplane address.
pub fn inbound_listener(name: &str, address: &str, port: u32, filter_chain: FilterChain) -> Listener {
    Listener {
        name: name.to_string(),
        address: Some(socket_address(address, port)),
        filter_chains: vec![filter_chain],
        traffic_direction: TrafficDirection::Inbound as i32,
        ..Default::default()
    }
}

/// Outbound listener, bound on loopback.
pub fn outbound_listener(name: &str, address: &str, port: u32, filter_chain: FilterChain) -> Listener {
    Listener {
        name: name.to_string(),
        address: Some(socket_address(address, port)),
        filter_chains: vec![filter_chain],
        traffic_direction: TrafficDirection::Outbound as i32,
        ..Default::default()
    }
}

/// Transparent proxying: accept redirected connections with their original
/// destination preserved instead of binding the workload port.
pub fn configure_transparent_proxying(listener: &mut Listener) {
    listener.listener_filters.push(ListenerFilter {
        name: ORIGINAL_DST_LISTENER_FILTER.to_string(),
        config_type: Some(ListenerFilterConfigType::TypedConfig(pack_any(
            ORIGINAL_DST_TYPE_URL,
            &OriginalDst::default(),
        ))),
        ..Default::default()
    });
    listener.bind_to_port = Some(BoolValue { value: false });
}
