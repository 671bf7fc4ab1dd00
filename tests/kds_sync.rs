//! Full-loop KDS test: a real server stream on loopback, consumed by a
//! sink, landing in a second store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use meshplane::core::dataplane::{
    AvailableService, DataplaneSpec, InboundInterface, Ingress, Networking,
};
use meshplane::core::resource::{Resource, ResourceSpec, ResourceType};
use meshplane::kds::global;
use meshplane::kds::server::{KdsDiscoveryService, KdsServer, ProvidedFilter};
use meshplane::kds::sink::{KdsSink, SyncCallbacks};
use meshplane::store::{InMemoryStore, ResourceStore, ResourceSyncer};

fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn workload(name: &str, zone: &str) -> Resource {
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
                ..Default::default()
            },
        }),
    )
}

fn ingress(name: &str, zone: &str) -> Resource {
    Resource::new(
        "default",
        name,
        ResourceSpec::Dataplane(DataplaneSpec {
            networking: Networking {
                address: "192.168.0.10".into(),
                inbound: vec![InboundInterface {
                    port: 10001,
                    service_port: None,
                    address: None,
                    tags: tags(&[("cluster", zone)]),
                }],
                ingress: Some(Ingress {
                    available_services: vec![AvailableService {
                        tags: tags(&[("service", "web")]),
                    }],
                }),
                ..Default::default()
            },
        }),
    )
}

/// Bind a loopback listener and serve the KDS service on it.
async fn spawn_server(
    store: Arc<InMemoryStore>,
    stop: CancellationToken,
) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());

    let filter: ProvidedFilter = Arc::new(global::provided_filter);
    let server = Arc::new(KdsServer::new(
        store,
        global::PROVIDED_TYPES.to_vec(),
        filter,
        Duration::from_millis(100),
    ));
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(AggregatedDiscoveryServiceServer::new(KdsDiscoveryService::new(server)))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                stop.cancelled().await
            })
            .await
            .unwrap();
    });
    address
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn zone_receives_foreign_ingresses_with_rewritten_identity() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
    let stop = CancellationToken::new();

    // Global holds one workload plus ingresses of two zones.
    let global_store = Arc::new(InMemoryStore::new());
    global_store.create(workload("backend", "zone-a")).await.unwrap();
    global_store.create(ingress("ingress-a", "zone-a")).await.unwrap();
    global_store.create(ingress("ingress-b", "zone-b")).await.unwrap();

    let address = spawn_server(global_store.clone(), stop.clone()).await;

    // Zone-a pulls Dataplanes from Global.
    let zone_store = Arc::new(InMemoryStore::new());
    let callbacks =
        SyncCallbacks::new(ResourceSyncer::new(zone_store.clone()), false, None);
    let sink = Arc::new(KdsSink::new(
        "zone-a".to_string(),
        "global".to_string(),
        address,
        vec![ResourceType::Dataplane],
        Arc::new(callbacks),
    ));
    let sink_stop = stop.clone();
    let sink_task = {
        let sink = sink.clone();
        tokio::spawn(async move { sink.run(sink_stop).await })
    };

    // Only zone-b's ingress crosses, renamed with the origin marker.
    wait_for(|| {
        let store = zone_store.clone();
        async move {
            store
                .list(ResourceType::Dataplane, None)
                .await
                .unwrap()
                .iter()
                .any(|r| r.meta.name == "ingress-b.global")
        }
    })
    .await;

    let received = zone_store.list(ResourceType::Dataplane, None).await.unwrap();
    let names: Vec<_> = received.iter().map(|r| r.meta.name.as_str()).collect();
    assert_eq!(names, vec!["ingress-b.global"]);

    // A new ingress appearing at Global is pushed on the next tracker tick.
    global_store.create(ingress("ingress-c", "zone-c")).await.unwrap();
    wait_for(|| {
        let store = zone_store.clone();
        async move {
            store.list(ResourceType::Dataplane, None).await.unwrap().len() == 2
        }
    })
    .await;

    stop.cancel();
    let _ = sink_task.await;
}

#[tokio::test]
async fn sink_reconnects_after_late_server_start() {
    let stop = CancellationToken::new();

    // Start the sink before any server listens: dials fail and back off.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let zone_store = Arc::new(InMemoryStore::new());
    let callbacks = SyncCallbacks::new(ResourceSyncer::new(zone_store.clone()), false, None);
    let sink = Arc::new(KdsSink::new(
        "zone-a".to_string(),
        "global".to_string(),
        address.clone(),
        vec![ResourceType::Dataplane],
        Arc::new(callbacks),
    ));
    let sink_stop = stop.clone();
    let sink_task = {
        let sink = sink.clone();
        tokio::spawn(async move { sink.run(sink_stop).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;

    // Now bring the server up on the same port.
    let global_store = Arc::new(InMemoryStore::new());
    global_store.create(ingress("ingress-b", "zone-b")).await.unwrap();
    let port = address.rsplit(':').next().unwrap().to_string();
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await.unwrap();
    let filter: ProvidedFilter = Arc::new(global::provided_filter);
    let server = Arc::new(KdsServer::new(
        global_store,
        global::PROVIDED_TYPES.to_vec(),
        filter,
        Duration::from_millis(100),
    ));
    let server_stop = stop.clone();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(AggregatedDiscoveryServiceServer::new(KdsDiscoveryService::new(server)))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                server_stop.cancelled().await
            })
            .await
            .unwrap();
    });

    wait_for(|| {
        let store = zone_store.clone();
        async move { !store.list(ResourceType::Dataplane, None).await.unwrap().is_empty() }
    })
    .await;

    stop.cancel();
    let _ = sink_task.await;
}
