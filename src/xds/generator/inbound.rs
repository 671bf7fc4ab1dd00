//! Inbound side of a proxy: one local cluster and one listener per
//! non-serviceless inbound.

use envoy_types::pb::envoy::config::listener::v3::FilterChain;

use crate::core::dataplane::Protocol;
use crate::core::policy::RateLimitSpec;
use crate::errors::Result;
use crate::xds::cluster::{configure_http2, static_cluster, strict_dns_cluster};
use crate::xds::context::{Proxy, XdsContext};
use crate::xds::generator::SnapshotGenerator;
use crate::xds::listener::{
    configure_transparent_proxying, inbound_listener, kafka_broker_filter, network_rbac_filter,
    parse_collector_url, server_side_mtls_transport, tcp_proxy_filter, tracing_cluster_name,
    HttpFilterChain,
};
use crate::xds::names::{inbound_listener_name, local_cluster_name};
use crate::xds::resources::{
    pack_any, ResourceKind, ResourceSet, XdsResource, CLUSTER_TYPE_URL, LISTENER_TYPE_URL,
};
use crate::xds::route::{build_routes, route_configuration, ClusterTarget, RouteEntry};
use crate::xds::tags::{matching_regex, regex_or, TAGS_HEADER_NAME};
use crate::xds::tls::create_downstream_tls_context;

pub const ORIGIN_INBOUND: &str = "inbound";

pub struct InboundProxyGenerator;

impl SnapshotGenerator for InboundProxyGenerator {
    fn generate(&self, ctx: &XdsContext, proxy: &Proxy) -> Result<ResourceSet> {
        let dataplane = proxy.dataplane.as_dataplane()?;
        let mesh_spec = ctx.mesh.mesh_spec()?;
        let mtls_enabled = mesh_spec.mtls_enabled();
        let mut resources = ResourceSet::new();

        let endpoints = dataplane.inbound_endpoints();
        for (inbound, endpoint) in dataplane.networking.inbound.iter().zip(endpoints) {
            // No inbounds for serviceless interfaces.
            let Some(service) = inbound.service() else { continue };
            let protocol = inbound.protocol();

            let cluster_name = local_cluster_name(endpoint.workload_port);
            let mut cluster =
                static_cluster(&cluster_name, &endpoint.workload_ip, endpoint.workload_port);
            if protocol.uses_http2_upstream() {
                configure_http2(&mut cluster)?;
            }
            resources.add(XdsResource {
                name: cluster_name.clone(),
                kind: ResourceKind::Cluster,
                origin: ORIGIN_INBOUND,
                resource: pack_any(CLUSTER_TYPE_URL, &cluster),
            });

            let listener_name =
                inbound_listener_name(&endpoint.dataplane_ip, endpoint.dataplane_port);

            let rate_limits = proxy.policies.rate_limits.get(&endpoint);
            let fault_injection = proxy
                .policies
                .fault_injections
                .get(&endpoint)
                .and_then(|f| f.first())
                .map(|f| f.conf.clone());
            let permissions = proxy
                .policies
                .traffic_permissions
                .get(&endpoint)
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            let tracing_backend = if protocol.is_http_based() {
                proxy
                    .policies
                    .traffic_trace
                    .as_ref()
                    .and_then(|t| mesh_spec.tracing_backend(&t.conf.backend))
            } else {
                None
            };

            let mut filters = match protocol {
                Protocol::Http | Protocol::Http2 | Protocol::Grpc => {
                    let routes = inbound_route_entries(
                        &cluster_name,
                        rate_limits.map(Vec::as_slice).unwrap_or(&[]),
                    );
                    let has_rate_limits = routes.iter().any(|r| r.rate_limit.is_some());
                    let route_config =
                        route_configuration(&listener_name, build_routes(&routes)?);

                    let mut chain = HttpFilterChain::new();
                    if protocol == Protocol::Grpc {
                        chain = chain.with_grpc_stats();
                    }
                    let hcm = chain
                        .with_fault_injection(fault_injection.as_ref())
                        .with_rate_limit(has_rate_limits)
                        .with_tracing(tracing_backend)?
                        .build(&listener_name, route_config);
                    vec![hcm]
                }
                Protocol::Kafka => vec![
                    kafka_broker_filter(&listener_name),
                    tcp_proxy_filter(&listener_name, &cluster_name),
                ],
                Protocol::Tcp => vec![tcp_proxy_filter(&listener_name, &cluster_name)],
            };

            // RBAC has to run ahead of the terminal filter.
            if let Some(rbac) = network_rbac_filter(
                &listener_name,
                ctx.mesh.mesh_name(),
                mtls_enabled,
                permissions,
            ) {
                filters.insert(0, rbac);
            }

            let mut filter_chain = FilterChain { filters, ..Default::default() };
            if let Some(tls_context) = create_downstream_tls_context(ctx, &proxy.metadata)? {
                filter_chain.transport_socket = Some(server_side_mtls_transport(&tls_context));
            }

            let mut listener = inbound_listener(
                &listener_name,
                &endpoint.dataplane_ip,
                endpoint.dataplane_port,
                filter_chain,
            );
            if dataplane.networking.transparent_proxying.is_some() {
                configure_transparent_proxying(&mut listener);
            }
            resources.add(XdsResource {
                name: listener_name,
                kind: ResourceKind::Listener,
                origin: ORIGIN_INBOUND,
                resource: pack_any(LISTENER_TYPE_URL, &listener),
            });

            // The collector cluster the tracing provider references.
            if let Some(backend) = tracing_backend {
                if let Some(zipkin) = &backend.zipkin {
                    let (host, port, _) = parse_collector_url(&zipkin.url)?;
                    let name = tracing_cluster_name(&backend.name);
                    let collector = strict_dns_cluster(&name, &host, port);
                    resources.add(XdsResource {
                        name,
                        kind: ResourceKind::Cluster,
                        origin: ORIGIN_INBOUND,
                        resource: pack_any(CLUSTER_TYPE_URL, &collector),
                    });
                }
            }

            tracing::debug!(
                service,
                listener = %inbound_listener_name(&endpoint.dataplane_ip, endpoint.dataplane_port),
                "Generated inbound resources"
            );
        }

        Ok(resources)
    }
}

/// Routes for one inbound: one per rate-limit source selector (matched by a
/// regex over the tags header), then the default catch-all last. The rate
/// limit list is already sorted most specific first.
fn inbound_route_entries(cluster_name: &str, rate_limits: &[RateLimitSpec]) -> Vec<RouteEntry> {
    let mut entries = Vec::new();

    for rate_limit in rate_limits {
        let Some(http) = &rate_limit.conf.http else { continue };
        let mut entry = RouteEntry::from_cluster(ClusterTarget::new(cluster_name, 100));
        if !rate_limit.sources.is_empty() {
            let combined = regex_or(rate_limit.source_tags().into_iter().map(matching_regex));
            let mut rules = crate::core::policy::TrafficRouteHttpMatch::default();
            rules.headers.insert(
                TAGS_HEADER_NAME.to_string(),
                crate::core::policy::StringMatch::Regex(combined),
            );
            entry.match_rules = Some(rules);
        }
        entry.rate_limit = Some(http.clone());
        entries.push(entry);
    }

    entries.push(RouteEntry::from_cluster(ClusterTarget::new(cluster_name, 100)));
    entries
}
