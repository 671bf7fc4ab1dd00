//! # Configuration Management
//!
//! Layered configuration for the control plane: defaults, then an optional
//! YAML file, then `MESHPLANE_`-prefixed environment variables.

pub mod settings;

pub use settings::{
    AppConfig, DpServerConfig, GlobalPeerConfig, IngressConfig, KdsServerSettings, Mode,
    ObservabilityConfig, RemoteConfig, SdsConfig, StoreConfig, StoreType, XdsGenerationConfig,
    ZonePeerConfig,
};

use std::path::Path;

use config::{Config, Environment, File};

use crate::errors::{Error, Result};

/// Load application configuration from multiple sources
///
/// Configuration is loaded in the following order (later sources override
/// earlier ones):
/// 1. Default values
/// 2. Configuration file (if specified)
/// 3. Environment variables with MESHPLANE_ prefix (nested keys separated
///    by `__`, e.g. `MESHPLANE_KDS_SERVER__PORT`)
pub fn load_config<P: AsRef<Path>>(config_path: Option<P>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    builder = builder.add_source(
        Config::try_from(&AppConfig::default())
            .map_err(|e| Error::config_with_source("Failed to seed defaults", Box::new(e)))?,
    );

    if let Some(path) = config_path {
        let path = path.as_ref();
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(Error::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
    }

    builder = builder
        .add_source(Environment::with_prefix("MESHPLANE").separator("__").try_parsing(true));

    let config = builder
        .build()
        .map_err(|e| Error::config_with_source("Failed to build configuration", Box::new(e)))?;

    let app_config: AppConfig = config
        .try_deserialize()
        .map_err(|e| Error::config_with_source("Failed to deserialize configuration", Box::new(e)))?;

    app_config.validate()?;

    Ok(app_config)
}

/// Load configuration from environment variables only.
pub fn load_config_from_env() -> Result<AppConfig> {
    load_config::<&str>(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn file_overrides_defaults() {
        let yaml = r#"
mode: global
zones:
  - name: zone-1
    remote:
      address: "http://zone-1-cp:5685"
    ingress:
      address: "203.0.113.1:10001"
kds_server:
  port: 6790
"#;
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.mode, Mode::Global);
        assert_eq!(config.kds_server.port, 6790);
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.zones[0].ingress.address, "203.0.113.1:10001");
    }

    #[test]
    fn invalid_ingress_address_fails_load() {
        let yaml = r#"
mode: global
zones:
  - name: zone-1
    remote:
      address: "http://zone-1-cp:5685"
    ingress:
      address: "missing-port"
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = load_config(Some("/nonexistent/meshplane.yaml"));
        assert!(result.unwrap_err().to_string().contains("Configuration file not found"));
    }
}
