//! Logging and metrics bootstrap for the binary.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Initialize the tracing subscriber. `RUST_LOG` wins over the configured
/// level.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::config_with_source("Invalid log level", Box::new(e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| Error::config_with_source("Failed to init tracing", Box::new(e)))?;
    Ok(())
}

/// Install the Prometheus recorder and, when configured, its scrape
/// endpoint.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let builder = PrometheusBuilder::new();
    match &config.metrics_bind_address {
        Some(address) => {
            let addr: std::net::SocketAddr = address
                .parse()
                .map_err(|e| Error::config(format!("invalid metrics address '{}': {}", address, e)))?;
            builder
                .with_http_listener(addr)
                .install()
                .map_err(|e| Error::config_with_source("Failed to install metrics exporter", Box::new(e)))?;
        }
        None => {
            let recorder = builder.build_recorder();
            metrics::set_global_recorder(recorder)
                .map_err(|e| Error::config(format!("Failed to install metrics recorder: {}", e)))?;
        }
    }
    Ok(())
}
