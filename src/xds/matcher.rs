//! Policy Matcher: resolves applied policies to a Dataplane by inbound
//! endpoint.
//!
//! Contract: for each inbound, every policy kind yields an ordered list with
//! the most specific source tags first; ties are broken by lexicographic
//! tag-key order, then by resource name so the result is total.

use std::collections::HashMap;

use crate::core::dataplane::{DataplaneSpec, InboundEndpoint, OutboundInterface};
use crate::core::policy::{
    CircuitBreakerSpec, FaultInjectionSpec, HealthCheckSpec, RateLimitSpec, Selector,
    TrafficLogSpec, TrafficPermissionSpec, TrafficRouteSpec, TrafficTraceSpec,
};
use crate::core::resource::{Resource, ResourceSpec, Tags};

/// A matched TrafficPermission, keeping its name for diagnostics.
#[derive(Debug, Clone)]
pub struct MatchedPermission {
    pub name: String,
    pub spec: TrafficPermissionSpec,
}

/// Policies resolved against one Dataplane.
#[derive(Debug, Clone, Default)]
pub struct MatchedPolicies {
    pub traffic_permissions: HashMap<InboundEndpoint, Vec<MatchedPermission>>,
    pub fault_injections: HashMap<InboundEndpoint, Vec<FaultInjectionSpec>>,
    pub rate_limits: HashMap<InboundEndpoint, Vec<RateLimitSpec>>,
    /// Best route per outbound, in outbound order.
    pub traffic_routes: Vec<Option<TrafficRouteSpec>>,
    /// Best log per outbound, in outbound order.
    pub traffic_logs: Vec<Option<TrafficLogSpec>>,
    pub health_checks: HashMap<String, HealthCheckSpec>,
    pub circuit_breakers: HashMap<String, CircuitBreakerSpec>,
    pub traffic_trace: Option<TrafficTraceSpec>,
}

pub struct PolicyMatcher;

impl PolicyMatcher {
    /// Resolve every policy kind against the Dataplane's inbounds and
    /// outbounds.
    pub fn match_policies(
        dataplane: &DataplaneSpec,
        policies: &[Resource],
    ) -> MatchedPolicies {
        let mut matched = MatchedPolicies::default();

        let endpoints = dataplane.inbound_endpoints();
        for (inbound, endpoint) in dataplane.networking.inbound.iter().zip(endpoints) {
            let inbound_tags = &inbound.tags;

            matched.traffic_permissions.insert(
                endpoint.clone(),
                ranked(policies, inbound_tags, |spec| match spec {
                    ResourceSpec::TrafficPermission(p) => {
                        Some((p.sources.clone(), p.destinations.clone()))
                    }
                    _ => None,
                })
                .into_iter()
                .map(|r| MatchedPermission {
                    name: r.meta.name.clone(),
                    spec: match &r.spec {
                        ResourceSpec::TrafficPermission(p) => p.clone(),
                        _ => unreachable!(),
                    },
                })
                .collect(),
            );

            matched.fault_injections.insert(
                endpoint.clone(),
                ranked(policies, inbound_tags, |spec| match spec {
                    ResourceSpec::FaultInjection(p) => {
                        Some((p.sources.clone(), p.destinations.clone()))
                    }
                    _ => None,
                })
                .into_iter()
                .filter_map(|r| match &r.spec {
                    ResourceSpec::FaultInjection(p) => Some(p.clone()),
                    _ => None,
                })
                .collect(),
            );

            matched.rate_limits.insert(
                endpoint,
                ranked(policies, inbound_tags, |spec| match spec {
                    ResourceSpec::RateLimit(p) => Some((p.sources.clone(), p.destinations.clone())),
                    _ => None,
                })
                .into_iter()
                .filter_map(|r| match &r.spec {
                    ResourceSpec::RateLimit(p) => Some(p.clone()),
                    _ => None,
                })
                .collect(),
            );
        }

        for outbound in &dataplane.networking.outbound {
            matched.traffic_routes.push(Self::best_for_outbound(policies, outbound, |spec| {
                match spec {
                    ResourceSpec::TrafficRoute(p) => {
                        Some((p.sources.clone(), p.destinations.clone()))
                    }
                    _ => None,
                }
            })
            .and_then(|r| match &r.spec {
                ResourceSpec::TrafficRoute(p) => Some(p.clone()),
                _ => None,
            }));

            matched.traffic_logs.push(Self::best_for_outbound(policies, outbound, |spec| {
                match spec {
                    ResourceSpec::TrafficLog(p) => Some((p.sources.clone(), p.destinations.clone())),
                    _ => None,
                }
            })
            .and_then(|r| match &r.spec {
                ResourceSpec::TrafficLog(p) => Some(p.clone()),
                _ => None,
            }));

            if let Some(service) = outbound.service() {
                if let Some(r) = Self::best_for_outbound(policies, outbound, |spec| match spec {
                    ResourceSpec::HealthCheck(p) => Some((p.sources.clone(), p.destinations.clone())),
                    _ => None,
                }) {
                    if let ResourceSpec::HealthCheck(p) = &r.spec {
                        matched.health_checks.insert(service.to_string(), p.clone());
                    }
                }
                if let Some(r) = Self::best_for_outbound(policies, outbound, |spec| match spec {
                    ResourceSpec::CircuitBreaker(p) => {
                        Some((p.sources.clone(), p.destinations.clone()))
                    }
                    _ => None,
                }) {
                    if let ResourceSpec::CircuitBreaker(p) = &r.spec {
                        matched.circuit_breakers.insert(service.to_string(), p.clone());
                    }
                }
            }
        }

        // TrafficTrace selects by the whole dataplane's tag union.
        let dataplane_tags: Tags = dataplane
            .networking
            .inbound
            .iter()
            .flat_map(|i| i.tags.clone())
            .collect();
        matched.traffic_trace = policies
            .iter()
            .filter_map(|r| match &r.spec {
                ResourceSpec::TrafficTrace(p) => Some((r, p)),
                _ => None,
            })
            .filter(|(_, p)| p.selectors.iter().any(|s| s.matches(&dataplane_tags)))
            .max_by(|(ra, pa), (rb, pb)| {
                max_specificity(&pa.selectors)
                    .cmp(&max_specificity(&pb.selectors))
                    .then_with(|| rb.meta.name.cmp(&ra.meta.name))
            })
            .map(|(_, p)| p.clone());

        matched
    }

    fn best_for_outbound<'a, F>(
        policies: &'a [Resource],
        outbound: &OutboundInterface,
        extract: F,
    ) -> Option<&'a Resource>
    where
        F: Fn(&ResourceSpec) -> Option<(Vec<Selector>, Vec<Selector>)>,
    {
        let mut candidates = ranked(policies, &outbound.tags, extract);
        if candidates.is_empty() {
            None
        } else {
            Some(candidates.remove(0))
        }
    }
}

fn max_specificity(selectors: &[Selector]) -> usize {
    selectors.iter().map(Selector::specificity).max().unwrap_or(0)
}

/// Lexicographic key list of the most specific selector; the tie-breaker.
fn tag_key_order(selectors: &[Selector]) -> Vec<String> {
    selectors
        .iter()
        .max_by_key(|s| s.specificity())
        .map(|s| s.match_tags.keys().cloned().collect())
        .unwrap_or_default()
}

/// Policies of one kind whose destinations match `tags`, ordered most
/// specific source first, ties by lexicographic tag-key order, then name.
fn ranked<'a, F>(policies: &'a [Resource], tags: &Tags, extract: F) -> Vec<&'a Resource>
where
    F: Fn(&ResourceSpec) -> Option<(Vec<Selector>, Vec<Selector>)>,
{
    let mut matching: Vec<(&Resource, Vec<Selector>)> = policies
        .iter()
        .filter_map(|r| extract(&r.spec).map(|(sources, destinations)| (r, sources, destinations)))
        .filter(|(_, _, destinations)| destinations.iter().any(|d| d.matches(tags)))
        .map(|(r, sources, _)| (r, sources))
        .collect();

    matching.sort_by(|(ra, sa), (rb, sb)| {
        max_specificity(sb)
            .cmp(&max_specificity(sa))
            .then_with(|| tag_key_order(sa).cmp(&tag_key_order(sb)))
            .then_with(|| ra.meta.name.cmp(&rb.meta.name))
    });

    matching.into_iter().map(|(r, _)| r).collect()
}
