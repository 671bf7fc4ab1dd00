//! KDS server: serves resource snapshots to peer control planes over the
//! ADS bidi stream.
//!
//! Each connection negotiates the resource types the peer wants. On
//! subscription the server materializes the type from the store, applies the
//! provided filter and pushes a full snapshot; a per-stream tracker re-runs
//! the snapshot every refresh interval and pushes only when the
//! deterministic marshal changed. NACKs back the affected type off
//! exponentially (5 s cap).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::resource::{Resource, ResourceType};
use crate::errors::{Error, Result};
use crate::kds::wire::{batch_fingerprint, encode_resources, type_from_url};
use crate::store::ResourceStore;

/// Decides, per receiving peer, which resources leave the control plane.
pub type ProvidedFilter = Arc<dyn Fn(&str, &Resource) -> bool + Send + Sync>;

const NACK_BACKOFF_BASE: Duration = Duration::from_millis(100);
const NACK_BACKOFF_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct KdsServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub refresh_interval: Duration,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for KdsServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5685,
            refresh_interval: Duration::from_secs(1),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

/// Shared per-server state.
pub struct KdsServer {
    store: Arc<dyn ResourceStore>,
    provided_types: Vec<ResourceType>,
    filter: ProvidedFilter,
    refresh_interval: Duration,
}

impl KdsServer {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        provided_types: Vec<ResourceType>,
        filter: ProvidedFilter,
        refresh_interval: Duration,
    ) -> Self {
        Self { store, provided_types, filter, refresh_interval }
    }

    /// Materialize one type for one peer: list, filter, encode.
    async fn build_batch(
        &self,
        peer: &str,
        resource_type: ResourceType,
    ) -> Result<Vec<envoy_types::pb::google::protobuf::Any>> {
        let resources = self.store.list(resource_type, None).await?;
        let provided: Vec<Resource> =
            resources.into_iter().filter(|r| (self.filter)(peer, r)).collect();
        encode_resources(resource_type, &provided)
    }
}

/// Per-type stream state: last pushed version/nonce and ACK bookkeeping.
struct Subscription {
    version: u64,
    nonce: String,
    fingerprint: Vec<u8>,
    acked_version: Option<String>,
    nack_streak: u32,
    backoff_until: Option<Instant>,
}

impl Subscription {
    fn new() -> Self {
        Self {
            version: 0,
            nonce: String::new(),
            fingerprint: Vec::new(),
            acked_version: None,
            nack_streak: 0,
            backoff_until: None,
        }
    }

    fn nack_backoff(&mut self) {
        self.nack_streak += 1;
        let exp = NACK_BACKOFF_BASE * 2u32.saturating_pow(self.nack_streak.min(16));
        self.backoff_until = Some(Instant::now() + exp.min(NACK_BACKOFF_CAP));
    }

    fn backed_off(&self) -> bool {
        self.backoff_until.map(|until| Instant::now() < until).unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct KdsDiscoveryService {
    inner: Arc<KdsServer>,
}

impl KdsDiscoveryService {
    pub fn new(inner: Arc<KdsServer>) -> Self {
        Self { inner }
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for KdsDiscoveryService {
    type StreamAggregatedResourcesStream =
        ReceiverStream<std::result::Result<DiscoveryResponse, Status>>;
    type DeltaAggregatedResourcesStream =
        ReceiverStream<std::result::Result<DeltaDiscoveryResponse, Status>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let mut in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(100);
        let server = self.inner.clone();

        tokio::spawn(async move {
            let mut peer: Option<String> = None;
            let mut subscriptions: HashMap<ResourceType, Subscription> = HashMap::new();
            let mut ticker = tokio::time::interval(server.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    message = in_stream.next() => {
                        let request = match message {
                            Some(Ok(request)) => request,
                            Some(Err(status)) => {
                                warn!(error = %status, "KDS stream transport error");
                                break;
                            }
                            None => {
                                info!(peer = ?peer, "KDS stream closed by peer");
                                break;
                            }
                        };

                        if peer.is_none() {
                            peer = request.node.as_ref().map(|n| n.id.clone());
                        }
                        let Some(peer_id) = peer.clone() else {
                            let _ = tx
                                .send(Err(Status::invalid_argument("first request must carry a node id")))
                                .await;
                            break;
                        };

                        let resource_type = match type_from_url(&request.type_url) {
                            Ok(t) => t,
                            Err(err) => {
                                // Protocol error: terminate; the peer reconnects.
                                warn!(peer = %peer_id, error = %err, "Unknown KDS resource type");
                                let _ = tx.send(Err(Status::invalid_argument(err.to_string()))).await;
                                break;
                            }
                        };
                        if !server.provided_types.contains(&resource_type) {
                            warn!(peer = %peer_id, resource_type = %resource_type, "Peer subscribed to a type this server does not provide");
                            let _ = tx
                                .send(Err(Status::invalid_argument(format!(
                                    "type '{}' is not provided",
                                    resource_type
                                ))))
                                .await;
                            break;
                        }

                        let subscription =
                            subscriptions.entry(resource_type).or_insert_with(Subscription::new);

                        if let Some(error_detail) = &request.error_detail {
                            counter!("kds_nacks_total").increment(1);
                            subscription.nack_backoff();
                            warn!(
                                peer = %peer_id,
                                resource_type = %resource_type,
                                nonce = %request.response_nonce,
                                error_code = error_detail.code,
                                error_message = %error_detail.message,
                                "Peer rejected pushed resources"
                            );
                            continue;
                        }

                        let is_ack = !request.response_nonce.is_empty()
                            && request.response_nonce == subscription.nonce
                            && request.version_info == subscription.version.to_string();
                        if is_ack {
                            subscription.acked_version = Some(request.version_info.clone());
                            subscription.nack_streak = 0;
                            debug!(
                                peer = %peer_id,
                                resource_type = %resource_type,
                                version = %request.version_info,
                                "Peer acknowledged"
                            );
                            continue;
                        }

                        // Fresh subscription (or a resubscribe after restart):
                        // push the current snapshot.
                        match server.build_batch(&peer_id, resource_type).await {
                            Ok(batch) => {
                                subscription.fingerprint = batch_fingerprint(&batch);
                                subscription.version += 1;
                                subscription.nonce = Uuid::new_v4().to_string();
                                let response = DiscoveryResponse {
                                    version_info: subscription.version.to_string(),
                                    resources: batch,
                                    type_url: request.type_url.clone(),
                                    nonce: subscription.nonce.clone(),
                                    ..Default::default()
                                };
                                counter!("kds_pushes_total").increment(1);
                                info!(
                                    peer = %peer_id,
                                    resource_type = %resource_type,
                                    version = subscription.version,
                                    resource_count = response.resources.len(),
                                    "Pushing snapshot"
                                );
                                if tx.send(Ok(response)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                // One failed type must not poison the others.
                                warn!(
                                    peer = %peer_id,
                                    resource_type = %resource_type,
                                    error = %err,
                                    "Snapshot build failed"
                                );
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(peer_id) = peer.clone() else { continue };
                        for (resource_type, subscription) in subscriptions.iter_mut() {
                            if subscription.backed_off() {
                                continue;
                            }
                            let batch = match server.build_batch(&peer_id, *resource_type).await {
                                Ok(batch) => batch,
                                Err(err) => {
                                    warn!(
                                        peer = %peer_id,
                                        resource_type = %resource_type,
                                        error = %err,
                                        "Snapshot rebuild failed"
                                    );
                                    continue;
                                }
                            };
                            let fingerprint = batch_fingerprint(&batch);
                            if fingerprint == subscription.fingerprint {
                                continue;
                            }
                            subscription.fingerprint = fingerprint;
                            subscription.version += 1;
                            subscription.nonce = Uuid::new_v4().to_string();
                            let response = DiscoveryResponse {
                                version_info: subscription.version.to_string(),
                                resources: batch,
                                type_url: crate::kds::wire::type_url_for(*resource_type),
                                nonce: subscription.nonce.clone(),
                                ..Default::default()
                            };
                            counter!("kds_pushes_total").increment(1);
                            info!(
                                peer = %peer_id,
                                resource_type = %resource_type,
                                version = subscription.version,
                                last_acked = ?subscription.acked_version,
                                resource_count = response.resources.len(),
                                "Pushing changed snapshot"
                            );
                            if tx.send(Ok(response)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("KDS speaks the state-of-the-world protocol only"))
    }
}

/// Serve KDS until the shutdown future resolves.
pub async fn start_kds_server<F>(
    config: KdsServerConfig,
    server: Arc<KdsServer>,
    shutdown_signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .map_err(|e| Error::config(format!("invalid KDS address: {}", e)))?;

    let mut builder = Server::builder();
    if let Some(tls) = build_server_tls_config(&config)? {
        builder = builder
            .tls_config(tls)
            .map_err(|e| Error::transport(format!("failed to apply KDS TLS configuration: {}", e)))?;
    }

    info!(address = %addr, "Starting KDS server");
    builder
        .add_service(AggregatedDiscoveryServiceServer::new(KdsDiscoveryService::new(server)))
        .serve_with_shutdown(addr, shutdown_signal)
        .await
        .map_err(|e| Error::transport(format!("KDS server failed: {}", e)))?;
    Ok(())
}

fn build_server_tls_config(config: &KdsServerConfig) -> Result<Option<ServerTlsConfig>> {
    let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) else {
        return Ok(None);
    };
    let cert = std::fs::read(cert_path).map_err(|e| {
        Error::config(format!("failed to read KDS TLS certificate from '{}': {}", cert_path, e))
    })?;
    let key = std::fs::read(key_path).map_err(|e| {
        Error::config(format!("failed to read KDS TLS private key from '{}': {}", key_path, e))
    })?;
    Ok(Some(ServerTlsConfig::new().identity(Identity::from_pem(cert, key))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataplane::{DataplaneSpec, InboundInterface, Ingress, Networking};
    use crate::core::resource::{ResourceSpec, Tags};
    use crate::kds::wire::decode_resources;
    use crate::store::InMemoryStore;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn dataplane(name: &str, zone: &str, is_ingress: bool) -> Resource {
        Resource::new(
            "default",
            name,
            ResourceSpec::Dataplane(DataplaneSpec {
                networking: Networking {
                    address: "10.0.0.1".into(),
                    inbound: vec![InboundInterface {
                        port: 8080,
                        service_port: None,
                        address: None,
                        tags: tags(&[("service", "web"), ("cluster", zone)]),
                    }],
                    ingress: is_ingress.then(Ingress::default),
                    ..Default::default()
                },
            }),
        )
    }

    #[tokio::test]
    async fn build_batch_applies_the_provided_filter() {
        let store = Arc::new(InMemoryStore::new());
        store.create(dataplane("workload", "zone-a", false)).await.unwrap();
        store.create(dataplane("ingress-a", "zone-a", true)).await.unwrap();
        store.create(dataplane("ingress-b", "zone-b", true)).await.unwrap();

        let filter: ProvidedFilter = Arc::new(crate::kds::global::provided_filter);
        let server = KdsServer::new(
            store,
            vec![ResourceType::Dataplane],
            filter,
            Duration::from_secs(1),
        );

        // Peer zone-a: other zones' ingresses only, never its own, never
        // plain workloads.
        let batch = server.build_batch("zone-a", ResourceType::Dataplane).await.unwrap();
        let decoded = decode_resources(ResourceType::Dataplane, &batch).unwrap();
        let names: Vec<_> = decoded.iter().map(|r| r.meta.name.as_str()).collect();
        assert_eq!(names, vec!["ingress-b"]);
    }

    #[test]
    fn nack_backoff_is_capped() {
        let mut sub = Subscription::new();
        for _ in 0..20 {
            sub.nack_backoff();
        }
        let until = sub.backoff_until.unwrap();
        assert!(until <= Instant::now() + NACK_BACKOFF_CAP);
        assert!(sub.backed_off());
    }
}
