//! Outbound side of a proxy: a cluster (plus endpoints) per destination and
//! a listener per outbound interface.
//!
//! Endpoints come from two places: workload dataplanes of the mesh serving
//! the destination service, and ingress dataplanes of other zones whose
//! `available_services` advertise it.

use envoy_types::pb::envoy::config::listener::v3::FilterChain;

use crate::core::dataplane::Protocol;
use crate::core::policy::{TrafficRouteHttp, TrafficRouteSpec, TrafficRouteSplit};
use crate::core::resource::{Resource, CLUSTER_TAG, PROTOCOL_TAG, SERVICE_TAG};
use crate::errors::Result;
use crate::xds::cluster::{
    cluster_load_assignment, configure_circuit_breaker, configure_health_check, configure_http2,
    eds_cluster, upstream_tls_transport, ResolvedEndpoint,
};
use crate::xds::context::{Proxy, XdsContext};
use crate::xds::generator::SnapshotGenerator;
use crate::xds::listener::{
    outbound_listener, tcp_proxy_filter_with_log, tcp_proxy_weighted_filter, HttpFilterChain,
};
use crate::xds::names::{outbound_listener_name, service_cluster_name};
use crate::xds::resources::{
    pack_any, ResourceKind, ResourceSet, XdsResource, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL,
    LISTENER_TYPE_URL,
};
use crate::xds::route::{build_routes, route_configuration, ClusterTarget, RouteEntry};
use crate::xds::tls::create_upstream_tls_context;

pub const ORIGIN_OUTBOUND: &str = "outbound";

pub struct OutboundProxyGenerator;

/// One weighted destination cluster of an outbound.
#[derive(Debug, Clone)]
struct OutboundTarget {
    cluster_name: String,
    service: String,
    weight: u32,
}

impl SnapshotGenerator for OutboundProxyGenerator {
    fn generate(&self, ctx: &XdsContext, proxy: &Proxy) -> Result<ResourceSet> {
        let dataplane = proxy.dataplane.as_dataplane()?;
        let mesh_spec = ctx.mesh.mesh_spec()?;
        let local_zone = dataplane.cluster_tag().unwrap_or("").to_string();
        let mut resources = ResourceSet::new();

        for (index, outbound) in dataplane.networking.outbound.iter().enumerate() {
            let Some(service) = outbound.service() else { continue };
            let route = proxy.policies.traffic_routes.get(index).and_then(|r| r.as_ref());
            let log = proxy.policies.traffic_logs.get(index).and_then(|l| l.as_ref());

            let default_targets = default_targets(service, route);
            let mut all_targets = default_targets.clone();
            if let Some(route) = route {
                for rule in &route.conf.http {
                    all_targets.extend(targets_for_split(service, &rule.split));
                }
            }

            // One cluster per distinct destination.
            let mut seen = Vec::new();
            for target in &all_targets {
                if seen.contains(&target.cluster_name) {
                    continue;
                }
                seen.push(target.cluster_name.clone());

                let protocol = service_protocol(&ctx.mesh.dataplanes, &target.service);
                let mut cluster = eds_cluster(&target.cluster_name);
                if protocol.uses_http2_upstream() {
                    configure_http2(&mut cluster)?;
                }
                if let Some(conf) = proxy.policies.health_checks.get(&target.service) {
                    configure_health_check(&mut cluster, &conf.conf);
                }
                if let Some(conf) = proxy.policies.circuit_breakers.get(&target.service) {
                    configure_circuit_breaker(&mut cluster, &conf.conf);
                }
                if let Some(tls_context) = create_upstream_tls_context(
                    ctx,
                    &proxy.metadata,
                    &target.service,
                    &target.service,
                )? {
                    cluster.transport_socket = Some(upstream_tls_transport(&tls_context));
                }
                resources.add(XdsResource {
                    name: target.cluster_name.clone(),
                    kind: ResourceKind::Cluster,
                    origin: ORIGIN_OUTBOUND,
                    resource: pack_any(CLUSTER_TYPE_URL, &cluster),
                });

                let endpoints =
                    resolve_service_endpoints(&ctx.mesh.dataplanes, &target.service);
                let assignment = cluster_load_assignment(
                    &target.cluster_name,
                    &endpoints,
                    mesh_spec.locality_aware_lb(),
                    &local_zone,
                );
                resources.add(XdsResource {
                    name: target.cluster_name.clone(),
                    kind: ResourceKind::Endpoint,
                    origin: ORIGIN_OUTBOUND,
                    resource: pack_any(ENDPOINT_TYPE_URL, &assignment),
                });
            }

            let listener_name = outbound_listener_name(outbound.listen_address(), outbound.port);
            let protocol = service_protocol(&ctx.mesh.dataplanes, service);
            let filter = if protocol.is_http_based() {
                let entries = outbound_route_entries(&default_targets, route);
                let route_config = route_configuration(&listener_name, build_routes(&entries)?);
                HttpFilterChain::new()
                    .with_access_log(log.map(|l| &l.conf))
                    .build(&listener_name, route_config)
            } else if default_targets.len() > 1 {
                let weighted: Vec<(String, u32)> = default_targets
                    .iter()
                    .map(|t| (t.cluster_name.clone(), t.weight))
                    .collect();
                tcp_proxy_weighted_filter(&listener_name, &weighted, log.map(|l| &l.conf))
            } else {
                tcp_proxy_filter_with_log(
                    &listener_name,
                    &default_targets[0].cluster_name,
                    log.map(|l| &l.conf),
                )
            };

            let listener = outbound_listener(
                &listener_name,
                outbound.listen_address(),
                outbound.port,
                FilterChain { filters: vec![filter], ..Default::default() },
            );
            resources.add(XdsResource {
                name: listener_name,
                kind: ResourceKind::Listener,
                origin: ORIGIN_OUTBOUND,
                resource: pack_any(LISTENER_TYPE_URL, &listener),
            });
        }

        Ok(resources)
    }
}

/// Targets of the default (non-rule) traffic: the route's top-level split,
/// or the outbound service alone.
fn default_targets(service: &str, route: Option<&TrafficRouteSpec>) -> Vec<OutboundTarget> {
    match route {
        Some(route) if !route.conf.split.is_empty() => {
            targets_for_split(service, &route.conf.split)
        }
        _ => vec![OutboundTarget {
            cluster_name: service_cluster_name(service, None),
            service: service.to_string(),
            weight: 100,
        }],
    }
}

/// Weighted targets of one split. A service appearing in several entries
/// gets index-suffixed cluster names, since weighted-cluster entries must be
/// unique.
fn targets_for_split(outbound_service: &str, split: &[TrafficRouteSplit]) -> Vec<OutboundTarget> {
    let services: Vec<String> = split
        .iter()
        .map(|s| {
            s.destination
                .get(SERVICE_TAG)
                .cloned()
                .unwrap_or_else(|| outbound_service.to_string())
        })
        .collect();
    split
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let service = &services[i];
            let duplicated = services.iter().filter(|s| *s == service).count() > 1;
            OutboundTarget {
                cluster_name: service_cluster_name(service, duplicated.then_some(i)),
                service: service.clone(),
                weight: entry.weight,
            }
        })
        .collect()
}

/// Route entries for an HTTP outbound: the route's HTTP rules in order,
/// then the default split as the catch-all.
fn outbound_route_entries(
    default_targets: &[OutboundTarget],
    route: Option<&TrafficRouteSpec>,
) -> Vec<RouteEntry> {
    let to_cluster_targets = |targets: &[OutboundTarget]| -> Vec<ClusterTarget> {
        targets.iter().map(|t| ClusterTarget::new(&t.cluster_name, t.weight)).collect()
    };

    let mut entries = Vec::new();
    if let Some(route) = route {
        for rule in &route.conf.http {
            entries.push(http_rule_entry(rule, default_targets, &to_cluster_targets));
        }
    }
    entries.push(RouteEntry {
        clusters: to_cluster_targets(default_targets),
        ..Default::default()
    });
    entries
}

fn http_rule_entry(
    rule: &TrafficRouteHttp,
    default_targets: &[OutboundTarget],
    to_cluster_targets: &dyn Fn(&[OutboundTarget]) -> Vec<ClusterTarget>,
) -> RouteEntry {
    let clusters = if rule.split.is_empty() {
        to_cluster_targets(default_targets)
    } else {
        let service = &default_targets[0].service;
        to_cluster_targets(&targets_for_split(service, &rule.split))
    };
    RouteEntry {
        match_rules: rule.match_rules.clone(),
        modify: rule.modify.clone(),
        clusters,
        rate_limit: None,
    }
}

/// Protocol a destination service speaks, learned from any inbound serving
/// it; unknown services default to TCP.
fn service_protocol(dataplanes: &[Resource], service: &str) -> Protocol {
    for resource in dataplanes {
        let Ok(dataplane) = resource.as_dataplane() else { continue };
        if dataplane.is_ingress() {
            continue;
        }
        for inbound in &dataplane.networking.inbound {
            if inbound.service() == Some(service) {
                return inbound.protocol();
            }
        }
    }
    // Ingress-advertised services carry their tags too.
    for resource in dataplanes {
        let Ok(dataplane) = resource.as_dataplane() else { continue };
        let Some(ingress) = &dataplane.networking.ingress else { continue };
        for available in &ingress.available_services {
            if available.tags.get(SERVICE_TAG).map(String::as_str) == Some(service) {
                if let Some(protocol) = available.tags.get(PROTOCOL_TAG) {
                    return Protocol::parse(protocol);
                }
            }
        }
    }
    Protocol::Tcp
}

/// Every endpoint serving `service`: local workloads directly, other zones
/// through their ingress. Sorted for stable load assignments.
fn resolve_service_endpoints(dataplanes: &[Resource], service: &str) -> Vec<ResolvedEndpoint> {
    let mut endpoints = Vec::new();
    for resource in dataplanes {
        let Ok(dataplane) = resource.as_dataplane() else { continue };
        if let Some(ingress) = &dataplane.networking.ingress {
            let advertises = ingress
                .available_services
                .iter()
                .any(|a| a.tags.get(SERVICE_TAG).map(String::as_str) == Some(service));
            if advertises {
                if let Some(inbound) = dataplane.networking.inbound.first() {
                    endpoints.push(ResolvedEndpoint {
                        address: dataplane.networking.address.clone(),
                        port: inbound.port,
                        zone: inbound.tags.get(CLUSTER_TAG).cloned().unwrap_or_default(),
                    });
                }
            }
            continue;
        }
        for (inbound, endpoint) in
            dataplane.networking.inbound.iter().zip(dataplane.inbound_endpoints())
        {
            if inbound.service() == Some(service) {
                endpoints.push(ResolvedEndpoint {
                    address: endpoint.dataplane_ip,
                    port: endpoint.dataplane_port,
                    zone: inbound.tags.get(CLUSTER_TAG).cloned().unwrap_or_default(),
                });
            }
        }
    }
    endpoints.sort_by(|a, b| (&a.address, a.port).cmp(&(&b.address, b.port)));
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataplane::{
        AvailableService, DataplaneSpec, InboundInterface, Ingress, Networking,
    };
    use crate::core::resource::{ResourceSpec, Tags};

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn workload(name: &str, service: &str, address: &str, port: u32, zone: &str) -> Resource {
        Resource::new(
            "default",
            name,
            ResourceSpec::Dataplane(DataplaneSpec {
                networking: Networking {
                    address: address.into(),
                    inbound: vec![InboundInterface {
                        port,
                        service_port: None,
                        address: None,
                        tags: tags(&[("service", service), ("cluster", zone), ("protocol", "http")]),
                    }],
                    ..Default::default()
                },
            }),
        )
    }

    fn ingress(name: &str, address: &str, port: u32, zone: &str, services: &[&str]) -> Resource {
        Resource::new(
            "default",
            name,
            ResourceSpec::Dataplane(DataplaneSpec {
                networking: Networking {
                    address: address.into(),
                    inbound: vec![InboundInterface {
                        port,
                        service_port: None,
                        address: None,
                        tags: tags(&[("cluster", zone)]),
                    }],
                    ingress: Some(Ingress {
                        available_services: services
                            .iter()
                            .map(|s| AvailableService { tags: tags(&[("service", s)]) })
                            .collect(),
                    }),
                    ..Default::default()
                },
            }),
        )
    }

    #[test]
    fn endpoints_include_workloads_and_remote_ingresses() {
        let dataplanes = vec![
            workload("web-1", "web", "10.0.0.1", 8080, "east"),
            workload("other", "api", "10.0.0.2", 8080, "east"),
            ingress("ingress-west", "203.0.113.1", 10001, "west", &["web"]),
            ingress("ingress-north", "203.0.113.2", 10001, "north", &["api"]),
        ];
        let endpoints = resolve_service_endpoints(&dataplanes, "web");
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].address, "10.0.0.1");
        assert_eq!(endpoints[0].zone, "east");
        assert_eq!(endpoints[1].address, "203.0.113.1");
        assert_eq!(endpoints[1].zone, "west");
    }

    #[test]
    fn split_with_duplicate_services_gets_indexed_cluster_names() {
        let split = vec![
            TrafficRouteSplit { weight: 90, destination: tags(&[("service", "backend")]) },
            TrafficRouteSplit {
                weight: 10,
                destination: tags(&[("service", "backend"), ("version", "v2")]),
            },
        ];
        let targets = targets_for_split("backend", &split);
        assert_eq!(targets[0].cluster_name, "backend-_0_");
        assert_eq!(targets[1].cluster_name, "backend-_1_");

        let single = targets_for_split(
            "backend",
            &[TrafficRouteSplit { weight: 100, destination: tags(&[("service", "backend")]) }],
        );
        assert_eq!(single[0].cluster_name, "backend");
    }

    #[test]
    fn service_protocol_prefers_workload_inbounds() {
        let dataplanes = vec![
            workload("web-1", "web", "10.0.0.1", 8080, "east"),
            ingress("ingress-west", "203.0.113.1", 10001, "west", &["db"]),
        ];
        assert_eq!(service_protocol(&dataplanes, "web"), Protocol::Http);
        assert_eq!(service_protocol(&dataplanes, "db"), Protocol::Tcp);
        assert_eq!(service_protocol(&dataplanes, "missing"), Protocol::Tcp);
    }

    #[test]
    fn default_route_entry_is_the_catch_all() {
        let targets = vec![OutboundTarget {
            cluster_name: "backend".into(),
            service: "backend".into(),
            weight: 100,
        }];
        let entries = outbound_route_entries(&targets, None);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].match_rules.is_none());
        assert_eq!(entries[0].clusters[0].name, "backend");
    }
}
