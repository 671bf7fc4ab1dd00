//! Mesh spec: the top-level policy and security scope.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtls: Option<MeshMtls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<MeshTracing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<MeshRouting>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshMtls {
    /// Name of the CA backend in force; empty means mTLS is off.
    #[serde(default)]
    pub enabled_backend: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<CertificateAuthorityBackend>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateAuthorityBackend {
    pub name: String,
    /// Backend kind, e.g. `builtin` or `provided`.
    #[serde(rename = "type")]
    pub backend_type: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshTracing {
    #[serde(default)]
    pub default_backend: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<TracingBackend>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingBackend {
    pub name: String,
    /// Fraction of sampled traces, 0.0..=100.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zipkin: Option<ZipkinBackend>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZipkinBackend {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshRouting {
    #[serde(default)]
    pub locality_aware_load_balancing: bool,
}

impl MeshSpec {
    pub fn mtls_enabled(&self) -> bool {
        self.mtls.as_ref().map(|m| !m.enabled_backend.is_empty()).unwrap_or(false)
    }

    pub fn locality_aware_lb(&self) -> bool {
        self.routing.as_ref().map(|r| r.locality_aware_load_balancing).unwrap_or(false)
    }

    /// Resolve a tracing backend by name; empty name means the default.
    pub fn tracing_backend(&self, name: &str) -> Option<&TracingBackend> {
        let tracing = self.tracing.as_ref()?;
        let wanted = if name.is_empty() { tracing.default_backend.as_str() } else { name };
        tracing.backends.iter().find(|b| b.name == wanted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtls_requires_an_enabled_backend() {
        let mut mesh = MeshSpec::default();
        assert!(!mesh.mtls_enabled());

        mesh.mtls = Some(MeshMtls { enabled_backend: String::new(), backends: vec![] });
        assert!(!mesh.mtls_enabled());

        mesh.mtls = Some(MeshMtls {
            enabled_backend: "ca-1".into(),
            backends: vec![CertificateAuthorityBackend {
                name: "ca-1".into(),
                backend_type: "builtin".into(),
            }],
        });
        assert!(mesh.mtls_enabled());
    }

    #[test]
    fn tracing_backend_resolution_uses_default() {
        let mesh = MeshSpec {
            tracing: Some(MeshTracing {
                default_backend: "zipkin-1".into(),
                backends: vec![TracingBackend {
                    name: "zipkin-1".into(),
                    sampling: Some(100.0),
                    zipkin: Some(ZipkinBackend { url: "http://zipkin:9411/api/v2/spans".into() }),
                }],
            }),
            ..Default::default()
        };
        assert!(mesh.tracing_backend("").is_some());
        assert!(mesh.tracing_backend("zipkin-1").is_some());
        assert!(mesh.tracing_backend("jaeger").is_none());
    }
}
