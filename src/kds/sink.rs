//! KDS sink: the client side of the bus.
//!
//! Maintains a connection to a peer control plane with resilient reconnect
//! (jittered backoff, re-subscribe from scratch) and applies every received
//! batch to the local store through the rewrite pipeline and the prefiltered
//! syncer. Handled batches are ACKed; decode or apply failures are NACKed
//! with the error detail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::google::rpc::Status as RpcStatus;
use metrics::counter;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::Request;
use tracing::{debug, info, warn};

use crate::core::resource::{Resource, ResourceType};
use crate::errors::{Error, Result};
use crate::kds::rewrite::{adjust_ingress_networking, dedup_ingresses, rewrite_names};
use crate::kds::wire::{decode_resources, type_from_url, type_url_for};
use crate::store::{NamePrefilter, ResourceSyncer};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const BACKOFF_FACTOR: f64 = 1.5;

/// Receives decoded batches; the outcome decides ACK vs NACK.
#[async_trait]
pub trait SinkCallbacks: Send + Sync {
    async fn on_resources_received(
        &self,
        peer_id: &str,
        resource_type: ResourceType,
        resources: Vec<Resource>,
    ) -> Result<()>;
}

/// The standard callbacks: name rewrite, ingress dedup + networking rewrite,
/// prefiltered store sync.
pub struct SyncCallbacks {
    syncer: ResourceSyncer,
    k8s_store: bool,
    /// Public `host:port` of the peer zone's ingress; set on the Global side.
    ingress_address: Option<(String, u32)>,
}

impl SyncCallbacks {
    pub fn new(
        syncer: ResourceSyncer,
        k8s_store: bool,
        ingress_address: Option<(String, u32)>,
    ) -> Self {
        Self { syncer, k8s_store, ingress_address }
    }
}

#[async_trait]
impl SinkCallbacks for SyncCallbacks {
    async fn on_resources_received(
        &self,
        peer_id: &str,
        resource_type: ResourceType,
        mut resources: Vec<Resource>,
    ) -> Result<()> {
        // An empty batch is never applied; wiping local state requires an
        // explicit delete upstream.
        if resources.is_empty() {
            debug!(peer = %peer_id, resource_type = %resource_type, "Ignoring empty batch");
            return Ok(());
        }

        // Input order from the peer stream is unspecified; sort so the
        // first-seen ingress is deterministic.
        resources.sort_by(|a, b| a.key().cmp(&b.key()));
        rewrite_names(&mut resources, peer_id, self.k8s_store);

        if resource_type == ResourceType::Dataplane {
            resources = dedup_ingresses(resources);
            if let Some((host, port)) = &self.ingress_address {
                adjust_ingress_networking(&mut resources, host, *port);
            }
        }

        let prefilter = NamePrefilter::by_owner(peer_id);
        self.syncer.sync(resource_type, resources, &prefilter).await
    }
}

pub struct KdsSink {
    /// Our own identity, carried in the request node.
    node_id: String,
    /// Identity of the peer; the origin marker on everything it sends us.
    peer_id: String,
    peer_address: String,
    consumed_types: Vec<ResourceType>,
    callbacks: Arc<dyn SinkCallbacks>,
}

impl KdsSink {
    pub fn new(
        node_id: String,
        peer_id: String,
        peer_address: String,
        consumed_types: Vec<ResourceType>,
        callbacks: Arc<dyn SinkCallbacks>,
    ) -> Self {
        Self { node_id, peer_id, peer_address, consumed_types, callbacks }
    }

    /// Dial-and-consume until stopped. Dial failures retry forever with
    /// jittered backoff; each reconnect re-subscribes from scratch.
    pub async fn run(&self, stop: CancellationToken) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if stop.is_cancelled() {
                return;
            }
            match self.stream_once(&stop).await {
                Ok(()) => return,
                Err(err) => {
                    counter!("kds_reconnects_total").increment(1);
                    let sleep = jitter(backoff);
                    warn!(
                        peer = %self.peer_id,
                        address = %self.peer_address,
                        error = %err,
                        retry_in_ms = sleep.as_millis() as u64,
                        "KDS connection lost"
                    );
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(sleep) => {}
                    }
                    backoff = backoff.mul_f64(BACKOFF_FACTOR).min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn stream_once(&self, stop: &CancellationToken) -> Result<()> {
        let endpoint = Endpoint::from_shared(self.peer_address.clone())
            .map_err(|e| Error::config(format!("invalid peer address: {}", e)))?
            .connect_timeout(DIAL_TIMEOUT);
        let channel = endpoint.connect().await?;
        let mut client = AggregatedDiscoveryServiceClient::new(channel);

        let (request_tx, request_rx) = mpsc::channel::<DiscoveryRequest>(100);
        for resource_type in &self.consumed_types {
            let initial = DiscoveryRequest {
                type_url: type_url_for(*resource_type),
                node: Some(Node { id: self.node_id.clone(), ..Default::default() }),
                ..Default::default()
            };
            request_tx
                .send(initial)
                .await
                .map_err(|_| Error::transport("request channel closed before subscribe"))?;
        }

        let mut responses = client
            .stream_aggregated_resources(Request::new(ReceiverStream::new(request_rx)))
            .await?
            .into_inner();
        info!(peer = %self.peer_id, address = %self.peer_address, "KDS stream established");

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                message = responses.message() => {
                    match message {
                        Ok(Some(response)) => self.handle_response(&request_tx, response).await?,
                        Ok(None) => return Err(Error::transport("KDS stream ended by peer")),
                        Err(status) => return Err(status.into()),
                    }
                }
            }
        }
    }

    async fn handle_response(
        &self,
        request_tx: &mpsc::Sender<DiscoveryRequest>,
        response: DiscoveryResponse,
    ) -> Result<()> {
        let outcome = self.apply_response(&response).await;
        let reply = match &outcome {
            Ok(resource_type) => {
                debug!(
                    peer = %self.peer_id,
                    resource_type = %resource_type,
                    version = %response.version_info,
                    resource_count = response.resources.len(),
                    "Applied batch"
                );
                DiscoveryRequest {
                    type_url: response.type_url.clone(),
                    version_info: response.version_info.clone(),
                    response_nonce: response.nonce.clone(),
                    node: Some(Node { id: self.node_id.clone(), ..Default::default() }),
                    ..Default::default()
                }
            }
            Err(err) => {
                warn!(
                    peer = %self.peer_id,
                    type_url = %response.type_url,
                    error = %err,
                    "Rejecting batch"
                );
                DiscoveryRequest {
                    type_url: response.type_url.clone(),
                    version_info: response.version_info.clone(),
                    response_nonce: response.nonce.clone(),
                    node: Some(Node { id: self.node_id.clone(), ..Default::default() }),
                    error_detail: Some(RpcStatus {
                        code: tonic::Code::InvalidArgument as i32,
                        message: err.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }
            }
        };
        request_tx
            .send(reply)
            .await
            .map_err(|_| Error::transport("request channel closed while replying"))?;
        Ok(())
    }

    async fn apply_response(&self, response: &DiscoveryResponse) -> Result<ResourceType> {
        let resource_type = type_from_url(&response.type_url)?;
        let resources = decode_resources(resource_type, &response.resources)?;
        self.callbacks.on_resources_received(&self.peer_id, resource_type, resources).await?;
        Ok(resource_type)
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}
