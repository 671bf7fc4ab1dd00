//! Policy specs applied to Dataplanes by tag selection.

use serde::{Deserialize, Serialize};

use crate::core::resource::Tags;

/// A tag selector. A missing key never matches; `*` matches any value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "match")]
    pub match_tags: Tags,
}

impl Selector {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self { match_tags: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect() }
    }

    /// Whether the selector matches the given tag set.
    pub fn matches(&self, tags: &Tags) -> bool {
        self.match_tags.iter().all(|(key, value)| match tags.get(key) {
            Some(actual) => value == "*" || actual == value,
            None => false,
        })
    }

    /// Number of non-wildcard tag constraints; used for specificity ranking.
    pub fn specificity(&self) -> usize {
        self.match_tags.values().filter(|v| v.as_str() != "*").count()
    }
}

/// Generic string matcher used in route matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringMatch {
    Prefix(String),
    Exact(String),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficPermissionSpec {
    pub sources: Vec<Selector>,
    pub destinations: Vec<Selector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRouteSpec {
    pub sources: Vec<Selector>,
    pub destinations: Vec<Selector>,
    pub conf: TrafficRouteConf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficRouteConf {
    /// Weighted destinations for non-HTTP (or fallback) traffic.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub split: Vec<TrafficRouteSplit>,
    /// HTTP rules, evaluated in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<TrafficRouteHttp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRouteSplit {
    pub weight: u32,
    pub destination: Tags,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficRouteHttp {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "match")]
    pub match_rules: Option<TrafficRouteHttpMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify: Option<TrafficRouteHttpModify>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub split: Vec<TrafficRouteSplit>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficRouteHttpMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<StringMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<StringMatch>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub headers: std::collections::BTreeMap<String, StringMatch>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficRouteHttpModify {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathModify>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostModify>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HeadersModify>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HeadersModify>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PathModify {
    RewritePrefix(String),
    Regex { pattern: String, substitution: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostModify {
    Value(String),
    FromPath { pattern: String, substitution: String },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadersModify {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<HeaderAdd>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderAdd {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficLogSpec {
    pub sources: Vec<Selector>,
    pub destinations: Vec<Selector>,
    #[serde(default)]
    pub conf: TrafficLogConf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficLogConf {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficTraceSpec {
    pub selectors: Vec<Selector>,
    #[serde(default)]
    pub conf: TrafficTraceConf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficTraceConf {
    /// Tracing backend name from the Mesh; empty selects the default.
    #[serde(default)]
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultInjectionSpec {
    pub sources: Vec<Selector>,
    pub destinations: Vec<Selector>,
    pub conf: FaultInjectionConf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FaultInjectionConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<FaultDelay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<FaultAbort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultDelay {
    pub percentage: f64,
    pub value_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultAbort {
    pub percentage: f64,
    pub http_status: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub sources: Vec<Selector>,
    pub destinations: Vec<Selector>,
    pub conf: HealthCheckConf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthCheckConf {
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub unhealthy_threshold: u32,
    #[serde(default)]
    pub healthy_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSpec {
    pub sources: Vec<Selector>,
    pub destinations: Vec<Selector>,
    pub conf: CircuitBreakerConf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CircuitBreakerConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub sources: Vec<Selector>,
    pub destinations: Vec<Selector>,
    pub conf: RateLimitConf,
}

impl RateLimitSpec {
    /// Source tag maps, used to synthesize per-selector routes.
    pub fn source_tags(&self) -> Vec<&Tags> {
        self.sources.iter().map(|s| &s.match_tags).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RateLimitConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<RateLimitHttp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitHttp {
    pub requests: u32,
    pub interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_rate_limit: Option<OnRateLimit>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OnRateLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderAdd>,
}

/// An opaque secret synced from Global (CA material and the like).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretSpec {
    /// Base64-encoded payload.
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn selector_wildcard_and_exact_matching() {
        let selector = Selector::new(&[("service", "*"), ("env", "prod")]);
        assert!(selector.matches(&tags(&[("service", "web"), ("env", "prod")])));
        assert!(!selector.matches(&tags(&[("service", "web"), ("env", "dev")])));
        assert!(!selector.matches(&tags(&[("env", "prod")])));
        assert_eq!(selector.specificity(), 1);
        assert_eq!(Selector::new(&[("service", "web"), ("env", "prod")]).specificity(), 2);
    }

    #[test]
    fn rate_limit_source_tags_are_exposed_in_order() {
        let spec = RateLimitSpec {
            sources: vec![
                Selector::new(&[("service", "frontend")]),
                Selector::new(&[("service", "*")]),
            ],
            destinations: vec![Selector::new(&[("service", "backend")])],
            conf: RateLimitConf {
                http: Some(RateLimitHttp { requests: 10, interval_ms: 1000, on_rate_limit: None }),
            },
        };
        let sources = spec.source_tags();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].get("service").unwrap(), "frontend");
    }
}
