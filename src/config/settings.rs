//! Configuration settings structures.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{Error, Result};
use crate::kds::rewrite::parse_ingress_address;

/// Which half of the bus this control plane runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Global,
    Zone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Memory,
    Kubernetes,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub mode: Mode,
    /// Name of this zone; required (and meaningful) in zone mode.
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub xds: XdsGenerationConfig,
    #[serde(default)]
    pub kds_server: KdsServerSettings,
    /// Peer zones; consumed by a Global control plane.
    #[serde(default)]
    pub zones: Vec<ZonePeerConfig>,
    /// The Global control plane; consumed by a Zone control plane.
    #[serde(default)]
    pub global: Option<GlobalPeerConfig>,
    /// The dataplane-facing server (ADS/SDS collaborator); its certificate
    /// is what sidecars pin when dialing SDS.
    #[serde(default)]
    pub dp_server: DpServerConfig,
    #[serde(default)]
    pub sds: SdsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Zone,
            zone: String::new(),
            store: StoreConfig::default(),
            xds: XdsGenerationConfig::default(),
            kds_server: KdsServerSettings::default(),
            zones: Vec::new(),
            global: None,
            dp_server: DpServerConfig::default(),
            sds: SdsConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DpServerConfig {
    #[serde(default)]
    pub tls_cert_path: String,
    #[serde(default)]
    pub tls_key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub store_type: StoreType,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { store_type: StoreType::Memory }
    }
}

impl StoreConfig {
    /// Kubernetes stores namespace synced resources via a name suffix.
    pub fn is_kubernetes(&self) -> bool {
        self.store_type == StoreType::Kubernetes
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XdsGenerationConfig {
    /// Watchdog tick period.
    pub refresh_interval_secs: u64,
}

impl Default for XdsGenerationConfig {
    fn default() -> Self {
        Self { refresh_interval_secs: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdsServerSettings {
    pub bind_address: String,
    pub port: u16,
    /// SyncTracker re-snapshot period.
    pub refresh_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<String>,
}

impl Default for KdsServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5685,
            refresh_interval_secs: 1,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ZonePeerConfig {
    #[validate(length(min = 1, message = "Zone name cannot be empty"))]
    pub name: String,
    pub remote: RemoteConfig,
    pub ingress: IngressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// KDS endpoint of the zone, e.g. `http://zone-1-cp:5685`.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Public `host:port` of the zone's ingress dataplane.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPeerConfig {
    /// KDS endpoint of the Global control plane.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdsConfig {
    /// `host:port` sidecars dial for certificate material.
    pub location: String,
}

impl Default for SdsConfig {
    fn default() -> Self {
        Self { location: "127.0.0.1:5677".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_bind_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), metrics_bind_address: None }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Zone => {
                if self.zone.is_empty() {
                    return Err(Error::config("zone mode requires a zone name"));
                }
                if self.global.is_none() {
                    return Err(Error::config("zone mode requires global.address"));
                }
            }
            Mode::Global => {
                for peer in &self.zones {
                    peer.validate().map_err(|e| {
                        Error::config(format!("invalid zone entry '{}': {}", peer.name, e))
                    })?;
                    if peer.remote.address.is_empty() {
                        return Err(Error::config(format!(
                            "zone '{}' has an empty remote.address",
                            peer.name
                        )));
                    }
                    // Parsed once here; later rewrites rely on validity.
                    parse_ingress_address(&peer.ingress.address)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone_peer(name: &str, ingress: &str) -> ZonePeerConfig {
        ZonePeerConfig {
            name: name.to_string(),
            remote: RemoteConfig { address: "http://zone-cp:5685".to_string() },
            ingress: IngressConfig { address: ingress.to_string() },
        }
    }

    #[test]
    fn zone_mode_requires_name_and_global() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_err());

        config.zone = "zone-1".to_string();
        assert!(config.validate().is_err());

        config.global = Some(GlobalPeerConfig { address: "http://global:5685".to_string() });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn global_mode_validates_ingress_addresses() {
        let mut config = AppConfig { mode: Mode::Global, ..Default::default() };
        config.zones.push(zone_peer("zone-1", "203.0.113.1:10001"));
        assert!(config.validate().is_ok());

        config.zones.push(zone_peer("zone-2", "not-an-address"));
        assert!(config.validate().is_err());
    }
}
