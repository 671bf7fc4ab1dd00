//! TrafficRoute → Envoy route translation.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::core::v3::{
    header_value_option::HeaderAppendAction, HeaderValue, HeaderValueOption,
    RuntimeFractionalPercent,
};
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier, route::Action, route_action::ClusterSpecifier,
    route_action::HostRewriteSpecifier, route_match::PathSpecifier, weighted_cluster::ClusterWeight,
    HeaderMatcher, Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost,
    WeightedCluster,
};
use envoy_types::pb::envoy::extensions::filters::http::local_ratelimit::v3::LocalRateLimit;
use envoy_types::pb::envoy::r#type::matcher::v3::{
    regex_matcher, string_matcher, RegexMatchAndSubstitute, RegexMatcher, StringMatcher,
};
use envoy_types::pb::envoy::r#type::v3::{
    fractional_percent::DenominatorType, FractionalPercent, HttpStatus, TokenBucket,
};
use envoy_types::pb::google::protobuf::{Any, BoolValue, Duration, UInt32Value};

use crate::core::policy::{
    HostModify, PathModify, RateLimitHttp, StringMatch, TrafficRouteHttpMatch,
    TrafficRouteHttpModify,
};
use crate::errors::Result;
use crate::xds::resources::pack_any;

/// Filter name the per-route rate limit config attaches to.
pub const LOCAL_RATE_LIMIT_FILTER: &str = "envoy.filters.http.local_ratelimit";

const LOCAL_RATE_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.local_ratelimit.v3.LocalRateLimit";

/// Envoy's default when no timeout policy applies.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// One weighted destination of a route.
#[derive(Debug, Clone)]
pub struct ClusterTarget {
    pub name: String,
    pub weight: u32,
    pub is_external_service: bool,
    /// HTTP request timeout of the destination, if a policy set one.
    pub request_timeout_ms: Option<u64>,
}

impl ClusterTarget {
    pub fn new(name: &str, weight: u32) -> Self {
        Self {
            name: name.to_string(),
            weight,
            is_external_service: false,
            request_timeout_ms: None,
        }
    }
}

/// An intermediate route the generators assemble before translation.
#[derive(Debug, Clone, Default)]
pub struct RouteEntry {
    pub match_rules: Option<TrafficRouteHttpMatch>,
    pub modify: Option<TrafficRouteHttpModify>,
    pub clusters: Vec<ClusterTarget>,
    pub rate_limit: Option<RateLimitHttp>,
}

impl RouteEntry {
    pub fn from_cluster(target: ClusterTarget) -> Self {
        Self { clusters: vec![target], ..Default::default() }
    }
}

pub fn safe_regex(pattern: &str) -> RegexMatcher {
    RegexMatcher {
        engine_type: Some(regex_matcher::EngineType::GoogleRe2(regex_matcher::GoogleRe2::default())),
        regex: pattern.to_string(),
    }
}

fn build_string_matcher(matcher: &StringMatch) -> StringMatcher {
    let pattern = match matcher {
        StringMatch::Prefix(p) => string_matcher::MatchPattern::Prefix(p.clone()),
        StringMatch::Exact(e) => string_matcher::MatchPattern::Exact(e.clone()),
        StringMatch::Regex(r) => string_matcher::MatchPattern::SafeRegex(safe_regex(r)),
    };
    StringMatcher { match_pattern: Some(pattern), ..Default::default() }
}

fn header_matcher(name: &str, matcher: &StringMatch) -> HeaderMatcher {
    HeaderMatcher {
        name: name.to_string(),
        header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(build_string_matcher(
            matcher,
        ))),
        ..Default::default()
    }
}

/// Build the route match. Without a path rule Envoy still requires one, so
/// the default is prefix `/`. Headers are appended in lexicographic name
/// order for stable output; the method becomes a `:method` header matcher.
fn route_match(rules: Option<&TrafficRouteHttpMatch>) -> RouteMatch {
    let mut envoy_match = RouteMatch::default();

    let path = rules.and_then(|r| r.path.as_ref());
    envoy_match.path_specifier = Some(match path {
        None => PathSpecifier::Prefix("/".to_string()),
        Some(StringMatch::Prefix(p)) => PathSpecifier::Prefix(p.clone()),
        Some(StringMatch::Exact(e)) => PathSpecifier::Path(e.clone()),
        Some(StringMatch::Regex(r)) => PathSpecifier::SafeRegex(safe_regex(r)),
    });

    if let Some(rules) = rules {
        // BTreeMap iteration is already lexicographic.
        for (header_name, matcher) in &rules.headers {
            envoy_match.headers.push(header_matcher(header_name, matcher));
        }
        if let Some(method) = &rules.method {
            envoy_match.headers.push(header_matcher(":method", method));
        }
    }

    envoy_match
}

fn route_action(clusters: &[ClusterTarget], modify: Option<&TrafficRouteHttpModify>) -> RouteAction {
    let mut action = RouteAction::default();

    if let Some(first) = clusters.first() {
        let timeout_ms = first.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        action.timeout = Some(Duration {
            seconds: (timeout_ms / 1000) as i64,
            nanos: ((timeout_ms % 1000) * 1_000_000) as i32,
        });
    }

    if clusters.len() == 1 {
        action.cluster_specifier = Some(ClusterSpecifier::Cluster(clusters[0].name.clone()));
    } else {
        let mut weighted = Vec::with_capacity(clusters.len());
        let mut total_weight = 0u32;
        for target in clusters {
            weighted.push(ClusterWeight {
                name: target.name.clone(),
                weight: Some(UInt32Value { value: target.weight }),
                ..Default::default()
            });
            total_weight += target.weight;
        }
        action.cluster_specifier = Some(ClusterSpecifier::WeightedClusters(WeightedCluster {
            clusters: weighted,
            total_weight: Some(UInt32Value { value: total_weight }),
            ..Default::default()
        }));
    }

    if clusters.iter().any(|c| c.is_external_service) {
        action.host_rewrite_specifier =
            Some(HostRewriteSpecifier::AutoHostRewrite(BoolValue { value: true }));
    }

    if let Some(modify) = modify {
        apply_action_modifications(&mut action, modify);
    }

    action
}

fn apply_action_modifications(action: &mut RouteAction, modify: &TrafficRouteHttpModify) {
    match &modify.path {
        Some(PathModify::RewritePrefix(prefix)) => {
            action.prefix_rewrite = prefix.clone();
        }
        Some(PathModify::Regex { pattern, substitution }) => {
            action.regex_rewrite = Some(RegexMatchAndSubstitute {
                pattern: Some(safe_regex(pattern)),
                substitution: substitution.clone(),
            });
        }
        None => {}
    }

    match &modify.host {
        Some(HostModify::Value(host)) => {
            action.host_rewrite_specifier =
                Some(HostRewriteSpecifier::HostRewriteLiteral(host.clone()));
        }
        Some(HostModify::FromPath { pattern, substitution }) => {
            action.host_rewrite_specifier =
                Some(HostRewriteSpecifier::HostRewritePathRegex(RegexMatchAndSubstitute {
                    pattern: Some(safe_regex(pattern)),
                    substitution: substitution.clone(),
                }));
        }
        None => {}
    }
}

fn header_value_option(name: &str, value: &str, append: bool) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: name.to_string(),
            value: value.to_string(),
            ..Default::default()
        }),
        append_action: if append {
            HeaderAppendAction::AppendIfExistsOrAdd as i32
        } else {
            HeaderAppendAction::OverwriteIfExistsOrAdd as i32
        },
        ..Default::default()
    }
}

fn apply_header_modifications(route: &mut Route, modify: &TrafficRouteHttpModify) {
    if let Some(request) = &modify.request_headers {
        for add in &request.add {
            route.request_headers_to_add.push(header_value_option(&add.name, &add.value, add.append));
        }
        route.request_headers_to_remove.extend(request.remove.iter().cloned());
    }
    if let Some(response) = &modify.response_headers {
        for add in &response.add {
            route
                .response_headers_to_add
                .push(header_value_option(&add.name, &add.value, add.append));
        }
        route.response_headers_to_remove.extend(response.remove.iter().cloned());
    }
}

fn runtime_percent(runtime_key: &str) -> RuntimeFractionalPercent {
    RuntimeFractionalPercent {
        default_value: Some(FractionalPercent {
            numerator: 100,
            denominator: DenominatorType::Hundred as i32,
        }),
        runtime_key: runtime_key.to_string(),
    }
}

/// Per-route local rate limit: a token bucket with
/// `max_tokens == tokens_per_fill == requests`, always enabled and enforced,
/// with optional custom deny status and response headers.
pub fn local_rate_limit_config(conf: &RateLimitHttp) -> Result<Any> {
    let status = conf
        .on_rate_limit
        .as_ref()
        .and_then(|on| on.status)
        .map(|code| HttpStatus { code: code as i32 });
    let response_headers_to_add = conf
        .on_rate_limit
        .as_ref()
        .map(|on| {
            on.headers
                .iter()
                .map(|h| header_value_option(&h.name, &h.value, h.append))
                .collect()
        })
        .unwrap_or_default();

    let config = LocalRateLimit {
        stat_prefix: "rate_limit".to_string(),
        status,
        token_bucket: Some(TokenBucket {
            max_tokens: conf.requests,
            tokens_per_fill: Some(UInt32Value { value: conf.requests }),
            fill_interval: Some(Duration {
                seconds: (conf.interval_ms / 1000) as i64,
                nanos: ((conf.interval_ms % 1000) * 1_000_000) as i32,
            }),
        }),
        filter_enabled: Some(runtime_percent("local_rate_limit_enabled")),
        filter_enforced: Some(runtime_percent("local_rate_limit_enforced")),
        response_headers_to_add,
        ..Default::default()
    };
    Ok(pack_any(LOCAL_RATE_LIMIT_TYPE_URL, &config))
}

/// Translate intermediate routes into Envoy routes, in order.
pub fn build_routes(entries: &[RouteEntry]) -> Result<Vec<Route>> {
    let mut routes = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut route = Route {
            r#match: Some(route_match(entry.match_rules.as_ref())),
            action: Some(Action::Route(route_action(&entry.clusters, entry.modify.as_ref()))),
            ..Default::default()
        };

        if let Some(rate_limit) = &entry.rate_limit {
            let mut per_filter = HashMap::new();
            per_filter
                .insert(LOCAL_RATE_LIMIT_FILTER.to_string(), local_rate_limit_config(rate_limit)?);
            route.typed_per_filter_config = per_filter;
        }

        if let Some(modify) = &entry.modify {
            apply_header_modifications(&mut route, modify);
        }

        routes.push(route);
    }
    Ok(routes)
}

/// A single-virtual-host route configuration matching every authority.
pub fn route_configuration(name: &str, routes: Vec<Route>) -> RouteConfiguration {
    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: vec![VirtualHost {
            name: name.to_string(),
            domains: vec!["*".to_string()],
            routes,
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{HeaderAdd, HeadersModify, OnRateLimit};
    use prost::Message;

    #[test]
    fn default_match_is_prefix_slash() {
        let m = route_match(None);
        assert_eq!(m.path_specifier, Some(PathSpecifier::Prefix("/".into())));
        assert!(m.headers.is_empty());
    }

    #[test]
    fn headers_are_emitted_in_lexicographic_order_with_method_last() {
        let mut rules = TrafficRouteHttpMatch::default();
        rules.headers.insert("x-b".into(), StringMatch::Exact("2".into()));
        rules.headers.insert("x-a".into(), StringMatch::Prefix("1".into()));
        rules.method = Some(StringMatch::Exact("GET".into()));

        let m = route_match(Some(&rules));
        let names: Vec<_> = m.headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["x-a", "x-b", ":method"]);
    }

    #[test]
    fn weighted_clusters_carry_explicit_total_weight() {
        let action = route_action(
            &[ClusterTarget::new("a", 60), ClusterTarget::new("b", 40)],
            None,
        );
        let Some(ClusterSpecifier::WeightedClusters(weighted)) = action.cluster_specifier else {
            panic!("expected weighted clusters");
        };
        assert_eq!(weighted.total_weight, Some(UInt32Value { value: 100 }));
        let names: Vec<_> = weighted.clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn timeout_comes_from_the_first_cluster() {
        let mut first = ClusterTarget::new("a", 60);
        first.request_timeout_ms = Some(2_500);
        let action = route_action(&[first, ClusterTarget::new("b", 40)], None);
        assert_eq!(action.timeout, Some(Duration { seconds: 2, nanos: 500_000_000 }));
    }

    #[test]
    fn external_service_enables_auto_host_rewrite() {
        let mut target = ClusterTarget::new("httpbin", 100);
        target.is_external_service = true;
        let action = route_action(&[target], None);
        assert_eq!(
            action.host_rewrite_specifier,
            Some(HostRewriteSpecifier::AutoHostRewrite(BoolValue { value: true }))
        );
    }

    #[test]
    fn modify_section_translates_path_host_and_headers() {
        let modify = TrafficRouteHttpModify {
            path: Some(PathModify::RewritePrefix("/v2".into())),
            host: Some(HostModify::Value("internal.local".into())),
            request_headers: Some(HeadersModify {
                add: vec![HeaderAdd { name: "x-zone".into(), value: "east".into(), append: true }],
                remove: vec!["x-debug".into()],
            }),
            response_headers: None,
        };
        let entry = RouteEntry {
            modify: Some(modify),
            clusters: vec![ClusterTarget::new("backend", 100)],
            ..Default::default()
        };
        let routes = build_routes(&[entry]).unwrap();
        let Some(Action::Route(action)) = &routes[0].action else {
            panic!("expected route action");
        };
        assert_eq!(action.prefix_rewrite, "/v2");
        assert_eq!(
            action.host_rewrite_specifier,
            Some(HostRewriteSpecifier::HostRewriteLiteral("internal.local".into()))
        );
        assert_eq!(routes[0].request_headers_to_remove, vec!["x-debug".to_string()]);
        assert_eq!(
            routes[0].request_headers_to_add[0].append_action,
            HeaderAppendAction::AppendIfExistsOrAdd as i32
        );
    }

    #[test]
    fn per_route_rate_limit_builds_a_full_token_bucket() {
        let conf = RateLimitHttp {
            requests: 10,
            interval_ms: 1_000,
            on_rate_limit: Some(OnRateLimit {
                status: Some(423),
                headers: vec![HeaderAdd {
                    name: "retry-after".into(),
                    value: "1".into(),
                    append: false,
                }],
            }),
        };
        let any = local_rate_limit_config(&conf).unwrap();
        assert_eq!(any.type_url, LOCAL_RATE_LIMIT_TYPE_URL);
        let decoded = LocalRateLimit::decode(any.value.as_slice()).unwrap();
        let bucket = decoded.token_bucket.unwrap();
        assert_eq!(bucket.max_tokens, 10);
        assert_eq!(bucket.tokens_per_fill, Some(UInt32Value { value: 10 }));
        assert_eq!(decoded.status.unwrap().code, 423);
        assert_eq!(
            decoded.filter_enabled.unwrap().default_value.unwrap().numerator,
            100
        );
        assert_eq!(decoded.response_headers_to_add.len(), 1);
    }
}
