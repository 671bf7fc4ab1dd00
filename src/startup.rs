//! Component assembly per control plane mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::SnapshotCache;
use crate::config::{AppConfig, Mode};
use crate::errors::{Error, Result};
use crate::ingress::IngressReconciler;
use crate::kds::server::{start_kds_server, KdsServer, KdsServerConfig, ProvidedFilter};
use crate::kds::{global, zone};
use crate::runtime::{Component, ComponentManager};
use crate::store::InMemoryStore;
use crate::xds::context::ControlPlaneContext;
use crate::xds::generator::GeneratorPipeline;
use crate::xds::watchdog::{
    DataplaneWatchdogDependencies, DataplaneWatchdogFactory, WatchdogLifecycle,
};

struct KdsServerComponent {
    config: KdsServerConfig,
    server: Arc<KdsServer>,
}

#[async_trait]
impl Component for KdsServerComponent {
    fn name(&self) -> &str {
        "kds-server"
    }

    async fn run(&self, stop: CancellationToken) -> Result<()> {
        let shutdown = async move { stop.cancelled().await };
        start_kds_server(self.config.clone(), self.server.clone(), shutdown).await
    }
}

struct WatchdogLifecycleComponent {
    lifecycle: WatchdogLifecycle,
}

#[async_trait]
impl Component for WatchdogLifecycleComponent {
    fn name(&self) -> &str {
        "dataplane-watchdogs"
    }

    async fn run(&self, stop: CancellationToken) -> Result<()> {
        self.lifecycle.run(stop).await;
        Ok(())
    }
}

fn kds_server_config(config: &AppConfig) -> KdsServerConfig {
    KdsServerConfig {
        bind_address: config.kds_server.bind_address.clone(),
        port: config.kds_server.port,
        refresh_interval: Duration::from_secs(config.kds_server.refresh_interval_secs.max(1)),
        tls_cert_path: config.kds_server.tls_cert_path.clone(),
        tls_key_path: config.kds_server.tls_key_path.clone(),
    }
}

/// Assemble every component of the configured mode and run until the stop
/// token fires.
pub async fn run(config: AppConfig, stop: CancellationToken) -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(SnapshotCache::new());
    let mut manager = ComponentManager::new();
    let k8s_store = config.store.is_kubernetes();

    match config.mode {
        Mode::Global => {
            info!(zones = config.zones.len(), "Assembling Global control plane");
            let filter: ProvidedFilter = Arc::new(global::provided_filter);
            let server = Arc::new(KdsServer::new(
                store.clone(),
                global::PROVIDED_TYPES.to_vec(),
                filter,
                Duration::from_secs(config.kds_server.refresh_interval_secs.max(1)),
            ));
            manager.add(Arc::new(KdsServerComponent {
                config: kds_server_config(&config),
                server,
            }));
            for sink in global::zone_sinks(store.clone(), k8s_store, &config.zones)? {
                manager.add(sink);
            }
        }
        Mode::Zone => {
            info!(zone = %config.zone, "Assembling Zone control plane");
            let filter: ProvidedFilter = Arc::new(zone::provided_filter);
            let server = Arc::new(KdsServer::new(
                store.clone(),
                zone::PROVIDED_TYPES.to_vec(),
                filter,
                Duration::from_secs(config.kds_server.refresh_interval_secs.max(1)),
            ));
            manager.add(Arc::new(KdsServerComponent {
                config: kds_server_config(&config),
                server,
            }));

            let global_peer = config
                .global
                .as_ref()
                .ok_or_else(|| Error::config("zone mode requires global.address"))?;
            manager.add(zone::global_sink(store.clone(), k8s_store, &config.zone, global_peer)?);

            manager.add(Arc::new(IngressReconciler::new(
                store.clone(),
                Duration::from_secs(config.xds.refresh_interval_secs.max(1)),
            )));

            let deps = DataplaneWatchdogDependencies {
                store: store.clone(),
                cache: cache.clone(),
                control_plane: ControlPlaneContext {
                    sds_location: config.sds.location.clone(),
                    sds_tls_cert: read_sds_cert(&config)?,
                },
                pipeline: Arc::new(GeneratorPipeline::standard()),
            };
            let factory = DataplaneWatchdogFactory::new(
                deps,
                Duration::from_secs(config.xds.refresh_interval_secs.max(1)),
            );
            manager.add(Arc::new(WatchdogLifecycleComponent {
                lifecycle: WatchdogLifecycle::new(factory, store.clone()),
            }));
        }
    }

    manager.run(stop).await;
    Ok(())
}

fn read_sds_cert(config: &AppConfig) -> Result<Vec<u8>> {
    if config.dp_server.tls_cert_path.is_empty() {
        return Ok(Vec::new());
    }
    std::fs::read(&config.dp_server.tls_cert_path).map_err(|e| {
        Error::config(format!(
            "failed to read dataplane server certificate from '{}': {}",
            config.dp_server.tls_cert_path, e
        ))
    })
}
