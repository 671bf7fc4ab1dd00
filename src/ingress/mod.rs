//! Ingress reconciliation: keeps a Zone ingress's `available_services`
//! aligned with the union of inbound services of the Zone's workloads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::dataplane::AvailableService;
use crate::core::resource::{Resource, ResourceSpec, ResourceType};
use crate::errors::Result;
use crate::runtime::Component;
use crate::store::{InMemoryStore, ResourceStore, StoreEvent};

const CONFLICT_RETRIES: u32 = 5;
const CONFLICT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// The ordered, de-duplicated list of inbound tag sets of every non-ingress
/// Dataplane. Equality is exact tag-map equality; order is insertion order
/// of first occurrence.
pub fn available_services(dataplanes: &[Resource]) -> Vec<AvailableService> {
    let mut services: Vec<AvailableService> = Vec::new();
    for resource in dataplanes {
        let ResourceSpec::Dataplane(dataplane) = &resource.spec else { continue };
        if dataplane.is_ingress() {
            continue;
        }
        for inbound in &dataplane.networking.inbound {
            if services.iter().any(|s| s.tags == inbound.tags) {
                continue;
            }
            services.push(AvailableService { tags: inbound.tags.clone() });
        }
    }
    services
}

/// Recompute and persist one mesh's ingress. Returns whether a write
/// happened.
pub async fn update_available_services(
    store: &dyn ResourceStore,
    mesh: &str,
) -> Result<bool> {
    let dataplanes = store.list(ResourceType::Dataplane, Some(mesh)).await?;

    // The effective ingress is the first locally-registered one; ingresses
    // synced from peers carry an origin marker in their name and are not
    // ours to write.
    let Some(ingress) = dataplanes.iter().find(|r| {
        crate::kds::zone::provided_filter("", r)
            && r.as_dataplane().map(|dp| dp.is_ingress()).unwrap_or(false)
    }) else {
        return Ok(false);
    };

    let computed = available_services(&dataplanes);
    let current = ingress
        .as_dataplane()?
        .networking
        .ingress
        .as_ref()
        .map(|i| i.available_services.as_slice())
        .unwrap_or(&[]);
    if current == computed.as_slice() {
        return Ok(false);
    }

    let key = ingress.key();
    let mut backoff = CONFLICT_BACKOFF_BASE;
    for attempt in 1..=CONFLICT_RETRIES {
        // Re-read each attempt so the optimistic version is fresh.
        let mut latest = store.get(ResourceType::Dataplane, &key).await?;
        {
            let ResourceSpec::Dataplane(dataplane) = &mut latest.spec else {
                return Ok(false);
            };
            let Some(ingress_block) = dataplane.networking.ingress.as_mut() else {
                return Ok(false);
            };
            ingress_block.available_services = computed.clone();
        }
        match store.update(latest).await {
            Ok(_) => {
                info!(mesh, ingress = %key, services = computed.len(), "Updated available services");
                return Ok(true);
            }
            Err(err) if err.is_conflict() && attempt < CONFLICT_RETRIES => {
                debug!(mesh, ingress = %key, attempt, "Conflict updating ingress, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop returns on success or final error")
}

/// Zone component: reconciles every mesh on a tick, debounced by store
/// change notifications.
pub struct IngressReconciler {
    store: Arc<InMemoryStore>,
    interval: Duration,
}

impl IngressReconciler {
    pub fn new(store: Arc<InMemoryStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    async fn reconcile_all(&self) -> Result<()> {
        let meshes = self.store.list(ResourceType::Mesh, None).await?;
        for mesh in meshes {
            update_available_services(self.store.as_ref(), &mesh.meta.name).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Component for IngressReconciler {
    fn name(&self) -> &str {
        "ingress-reconciler"
    }

    async fn run(&self, stop: CancellationToken) -> Result<()> {
        let mut events = self.store.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile_all().await {
                        warn!(error = %err, "Ingress reconcile failed");
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(StoreEvent { resource_type: ResourceType::Dataplane, key, .. }) => {
                            if let Err(err) =
                                update_available_services(self.store.as_ref(), &key.mesh).await
                            {
                                warn!(mesh = %key.mesh, error = %err, "Ingress reconcile failed");
                            }
                        }
                        Ok(_) => {}
                        Err(_) => {
                            // Lagged or closed; the ticker recovers.
                        }
                    }
                }
            }
        }
    }
}
