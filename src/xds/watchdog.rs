//! Per-Dataplane watchdogs: the only writers into the snapshot cache.
//!
//! Every local Dataplane gets a single-threaded loop that, each tick, takes
//! a consistent cut of its mesh, resolves policies, runs the generator
//! pipeline and publishes the snapshot when (and only when) its fingerprint
//! changed. Slow ticks coalesce; errors keep the last-good snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::SnapshotCache;
use crate::core::resource::{Resource, ResourceKey, ResourceType};
use crate::errors::{Error, Result};
use crate::store::{ResourceStore, StoreEvent, StoreOp};
use crate::xds::context::{ControlPlaneContext, DataplaneMetadata, MeshContext, Proxy, XdsContext};
use crate::xds::generator::GeneratorPipeline;
use crate::xds::matcher::PolicyMatcher;

/// Policy kinds a generation run reads alongside the Dataplane and Mesh.
const POLICY_TYPES: [ResourceType; 8] = [
    ResourceType::TrafficPermission,
    ResourceType::TrafficRoute,
    ResourceType::TrafficLog,
    ResourceType::TrafficTrace,
    ResourceType::FaultInjection,
    ResourceType::HealthCheck,
    ResourceType::CircuitBreaker,
    ResourceType::RateLimit,
];

pub struct DataplaneWatchdogDependencies {
    pub store: Arc<dyn ResourceStore>,
    pub cache: Arc<SnapshotCache>,
    pub control_plane: ControlPlaneContext,
    pub pipeline: Arc<GeneratorPipeline>,
}

pub struct DataplaneWatchdog {
    deps: Arc<DataplaneWatchdogDependencies>,
    key: ResourceKey,
    last_fingerprint: Option<Vec<u8>>,
}

impl DataplaneWatchdog {
    pub fn new(deps: Arc<DataplaneWatchdogDependencies>, key: ResourceKey) -> Self {
        Self { deps, key, last_fingerprint: None }
    }

    /// One generation pass.
    pub async fn sync(&mut self) -> Result<()> {
        let started = std::time::Instant::now();

        // A single read lease: the Dataplane, its Mesh and every policy kind
        // form one consistent cut.
        let mut types = Vec::with_capacity(POLICY_TYPES.len() + 2);
        types.push(ResourceType::Dataplane);
        types.push(ResourceType::Mesh);
        types.extend(POLICY_TYPES);
        let mut lists = self.deps.store.list_many(&types, Some(&self.key.mesh)).await?;

        let policies: Vec<Resource> = lists.split_off(2).into_iter().flatten().collect();
        let meshes = lists.pop().unwrap_or_default();
        let dataplanes = lists.pop().unwrap_or_default();

        let dataplane = dataplanes
            .iter()
            .find(|r| r.key() == self.key)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(ResourceType::Dataplane, self.key.mesh.clone(), self.key.name.clone())
            })?;
        let mesh = meshes
            .into_iter()
            .find(|r| r.meta.name == self.key.mesh)
            .ok_or_else(|| {
                Error::not_found(ResourceType::Mesh, self.key.mesh.clone(), self.key.mesh.clone())
            })?;

        let matched = PolicyMatcher::match_policies(dataplane.as_dataplane()?, &policies);
        let ctx = XdsContext {
            control_plane: self.deps.control_plane.clone(),
            mesh: MeshContext { mesh, dataplanes, policies },
        };
        let proxy = Proxy {
            id: self.key.clone(),
            dataplane,
            metadata: DataplaneMetadata::default(),
            policies: matched,
        };

        let resources = self.deps.pipeline.generate(&ctx, &proxy)?;
        let snapshot = resources.into_snapshot();
        let fingerprint = snapshot.fingerprint();

        counter!("xds_generations_total").increment(1);
        histogram!("xds_generation_duration_seconds").record(started.elapsed().as_secs_f64());

        if self.last_fingerprint.as_deref() == Some(fingerprint.as_slice()) {
            debug!(key = %self.key, "Snapshot unchanged, publish skipped");
            return Ok(());
        }

        let version = self.deps.cache.set(&self.key, snapshot).await;
        self.last_fingerprint = Some(fingerprint);
        info!(key = %self.key, version, "Published snapshot");
        Ok(())
    }

    /// Drop the cache entry; watchers observe end-of-stream.
    pub async fn cleanup(&self) {
        self.deps.cache.clear(&self.key).await;
    }

    /// Tick until stopped. Missed ticks coalesce: a tick is skipped while the
    /// previous one still runs.
    pub async fn run(mut self, refresh_interval: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sync().await {
                        counter!("xds_generations_errors_total").increment(1);
                        error!(key = %self.key, error = %err, "Snapshot generation failed");
                    }
                }
            }
        }
        self.cleanup().await;
    }
}

/// Builds watchdogs wired to shared dependencies.
pub struct DataplaneWatchdogFactory {
    deps: Arc<DataplaneWatchdogDependencies>,
    refresh_interval: Duration,
}

impl DataplaneWatchdogFactory {
    pub fn new(deps: DataplaneWatchdogDependencies, refresh_interval: Duration) -> Self {
        Self { deps: Arc::new(deps), refresh_interval }
    }

    pub fn build(&self, key: ResourceKey) -> DataplaneWatchdog {
        DataplaneWatchdog::new(self.deps.clone(), key)
    }

    /// Spawn a watchdog task owning the right to publish for `key`.
    pub fn spawn(&self, key: ResourceKey, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
        let watchdog = self.build(key);
        let interval = self.refresh_interval;
        tokio::spawn(watchdog.run(interval, stop))
    }
}

/// Keeps the watchdog set aligned with the store's Dataplanes: one watchdog
/// per local Dataplane, stopped (which clears the cache key) on deletion.
pub struct WatchdogLifecycle {
    factory: DataplaneWatchdogFactory,
    store: Arc<crate::store::InMemoryStore>,
    active: Mutex<HashMap<ResourceKey, CancellationToken>>,
}

impl WatchdogLifecycle {
    pub fn new(factory: DataplaneWatchdogFactory, store: Arc<crate::store::InMemoryStore>) -> Self {
        Self { factory, store, active: Mutex::new(HashMap::new()) }
    }

    async fn reconcile(&self) -> Result<()> {
        let dataplanes = self.store.list(ResourceType::Dataplane, None).await?;
        let wanted: Vec<ResourceKey> = dataplanes
            .iter()
            .filter(|r| r.as_dataplane().map(|dp| !dp.is_ingress()).unwrap_or(false))
            .map(|r| r.key())
            .collect();

        let mut active = self.active.lock().await;
        for key in &wanted {
            if !active.contains_key(key) {
                let stop = CancellationToken::new();
                self.factory.spawn(key.clone(), stop.clone());
                active.insert(key.clone(), stop);
                debug!(key = %key, "Watchdog started");
            }
        }
        let stale: Vec<ResourceKey> =
            active.keys().filter(|k| !wanted.contains(k)).cloned().collect();
        for key in stale {
            if let Some(stop) = active.remove(&key) {
                stop.cancel();
                debug!(key = %key, "Watchdog stopped");
            }
        }
        Ok(())
    }

    /// Track store changes until stopped; every watchdog is cancelled on the
    /// way out so cache keys get cleared.
    pub async fn run(&self, stop: CancellationToken) {
        let mut events = self.store.subscribe();
        let mut resync = tokio::time::interval(Duration::from_secs(5));
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = resync.tick() => {
                    if let Err(err) = self.reconcile().await {
                        warn!(error = %err, "Watchdog reconcile failed");
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(StoreEvent { resource_type: ResourceType::Dataplane, op, .. })
                            if matches!(op, StoreOp::Create | StoreOp::Delete) =>
                        {
                            if let Err(err) = self.reconcile().await {
                                warn!(error = %err, "Watchdog reconcile failed");
                            }
                        }
                        Ok(_) => {}
                        Err(_) => {
                            // Lagged or closed; the periodic resync recovers.
                        }
                    }
                }
            }
        }
        let mut active = self.active.lock().await;
        for (_, token) in active.drain() {
            token.cancel();
        }
    }
}
