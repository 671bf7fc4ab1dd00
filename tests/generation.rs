//! End-to-end generation scenarios: store contents in, decoded Envoy
//! resources out.

use std::collections::BTreeMap;
use std::sync::Arc;

use envoy_types::pb::envoy::config::cluster::v3::{cluster, Cluster};
use envoy_types::pb::envoy::config::core::v3::address::Address as AddressType;
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::listener::v3::filter::ConfigType as FilterConfigType;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::route::Action;
use envoy_types::pb::envoy::config::route::v3::route_action::ClusterSpecifier;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::RouteSpecifier, HttpConnectionManager,
};
use envoy_types::pb::envoy::extensions::filters::network::rbac::v3::Rbac as NetworkRbac;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::DownstreamTlsContext;
use envoy_types::pb::envoy::r#type::matcher::v3::string_matcher::MatchPattern;
use prost::Message;

use meshplane::cache::SnapshotCache;
use meshplane::core::dataplane::{DataplaneSpec, InboundInterface, Networking};
use meshplane::core::mesh::{CertificateAuthorityBackend, MeshMtls, MeshSpec};
use meshplane::core::policy::{Selector, TrafficPermissionSpec};
use meshplane::core::resource::{Resource, ResourceKey, ResourceSpec};
use meshplane::store::{InMemoryStore, ResourceStore};
use meshplane::xds::context::ControlPlaneContext;
use meshplane::xds::generator::GeneratorPipeline;
use meshplane::xds::watchdog::{DataplaneWatchdog, DataplaneWatchdogDependencies};

fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn http_dataplane() -> Resource {
    Resource::new(
        "default",
        "backend-1",
        ResourceSpec::Dataplane(DataplaneSpec {
            networking: Networking {
                address: "10.0.0.1".into(),
                inbound: vec![InboundInterface {
                    port: 8080,
                    service_port: Some(9000),
                    address: None,
                    tags: tags(&[("service", "web"), ("protocol", "http")]),
                }],
                ..Default::default()
            },
        }),
    )
}

fn mesh(mtls: bool) -> Resource {
    let spec = MeshSpec {
        mtls: mtls.then(|| MeshMtls {
            enabled_backend: "ca-1".into(),
            backends: vec![CertificateAuthorityBackend {
                name: "ca-1".into(),
                backend_type: "builtin".into(),
            }],
        }),
        ..Default::default()
    };
    Resource::new("default", "default", ResourceSpec::Mesh(spec))
}

async fn generate(store: Arc<InMemoryStore>) -> meshplane::cache::EnvoySnapshot {
    let cache = Arc::new(SnapshotCache::new());
    let deps = DataplaneWatchdogDependencies {
        store,
        cache: cache.clone(),
        control_plane: ControlPlaneContext {
            sds_location: "meshplane-cp:5677".into(),
            sds_tls_cert: b"PEM".to_vec(),
        },
        pipeline: Arc::new(GeneratorPipeline::standard()),
    };
    let key = ResourceKey::new("default", "backend-1");
    let mut watchdog = DataplaneWatchdog::new(Arc::new(deps), key.clone());
    watchdog.sync().await.unwrap();
    (*cache.get(&key).await.unwrap()).clone()
}

fn decode_hcm(listener: &Listener) -> Option<HttpConnectionManager> {
    for filter in &listener.filter_chains[0].filters {
        if filter.name == "envoy.filters.network.http_connection_manager" {
            let Some(FilterConfigType::TypedConfig(any)) = &filter.config_type else {
                return None;
            };
            return HttpConnectionManager::decode(any.value.as_slice()).ok();
        }
    }
    None
}

#[tokio::test]
async fn plain_http_inbound_without_mtls() {
    let store = Arc::new(InMemoryStore::new());
    store.create(mesh(false)).await.unwrap();
    store.create(http_dataplane()).await.unwrap();

    let snapshot = generate(store).await;

    // Cluster localhost:9000, STATIC, pointed at 127.0.0.1:9000.
    let cluster_any = snapshot.clusters.get("localhost:9000").expect("local cluster");
    let cluster = Cluster::decode(cluster_any.value.as_slice()).unwrap();
    assert_eq!(
        cluster.cluster_discovery_type,
        Some(cluster::ClusterDiscoveryType::Type(cluster::DiscoveryType::Static as i32))
    );
    let endpoint = &cluster.load_assignment.unwrap().endpoints[0].lb_endpoints[0];
    let Some(envoy_types::pb::envoy::config::endpoint::v3::lb_endpoint::HostIdentifier::Endpoint(
        ep,
    )) = &endpoint.host_identifier
    else {
        panic!("expected endpoint");
    };
    let Some(AddressType::SocketAddress(socket)) = &ep.address.as_ref().unwrap().address else {
        panic!("expected socket address");
    };
    assert_eq!(socket.address, "127.0.0.1");
    assert_eq!(socket.port_specifier, Some(PortSpecifier::PortValue(9000)));

    // Listener inbound:10.0.0.1:8080 with an HCM routing to that cluster.
    let listener_any = snapshot.listeners.get("inbound:10.0.0.1:8080").expect("inbound listener");
    let listener = Listener::decode(listener_any.value.as_slice()).unwrap();
    let hcm = decode_hcm(&listener).expect("http connection manager");
    let Some(RouteSpecifier::RouteConfig(route_config)) = &hcm.route_specifier else {
        panic!("expected inline route config");
    };
    let route = &route_config.virtual_hosts[0].routes[0];
    let Some(Action::Route(action)) = &route.action else { panic!("expected route action") };
    assert_eq!(action.cluster_specifier, Some(ClusterSpecifier::Cluster("localhost:9000".into())));

    // No RBAC, no TLS.
    assert!(listener.filter_chains[0]
        .filters
        .iter()
        .all(|f| f.name != "envoy.filters.network.rbac"));
    assert!(listener.filter_chains[0].transport_socket.is_none());
}

#[tokio::test]
async fn mtls_inbound_gets_rbac_and_downstream_tls() {
    let store = Arc::new(InMemoryStore::new());
    store.create(mesh(true)).await.unwrap();
    store.create(http_dataplane()).await.unwrap();
    store
        .create(Resource::new(
            "default",
            "allow-all-to-web",
            ResourceSpec::TrafficPermission(TrafficPermissionSpec {
                sources: vec![Selector::new(&[("service", "*")])],
                destinations: vec![Selector::new(&[("service", "web")])],
            }),
        ))
        .await
        .unwrap();

    let snapshot = generate(store).await;
    let listener_any = snapshot.listeners.get("inbound:10.0.0.1:8080").unwrap();
    let listener = Listener::decode(listener_any.value.as_slice()).unwrap();
    let chain = &listener.filter_chains[0];

    // RBAC permits any principal under the mesh SPIFFE prefix.
    let rbac_filter = chain
        .filters
        .iter()
        .find(|f| f.name == "envoy.filters.network.rbac")
        .expect("rbac filter");
    let Some(FilterConfigType::TypedConfig(any)) = &rbac_filter.config_type else {
        panic!("expected typed config");
    };
    let rbac = NetworkRbac::decode(any.value.as_slice()).unwrap();
    let policy = rbac.rules.unwrap().policies["inbound:10.0.0.1:8080"].clone();
    let Some(envoy_types::pb::envoy::config::rbac::v3::principal::Identifier::Authenticated(auth)) =
        &policy.principals[0].identifier
    else {
        panic!("expected authenticated principal");
    };
    assert_eq!(
        auth.principal_name.as_ref().unwrap().match_pattern,
        Some(MatchPattern::Prefix("spiffe://default/".into()))
    );

    // Downstream TLS requires a client certificate.
    let socket = chain.transport_socket.as_ref().expect("tls transport socket");
    let Some(
        envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType::TypedConfig(any),
    ) = &socket.config_type
    else {
        panic!("expected typed transport socket");
    };
    let tls = DownstreamTlsContext::decode(any.value.as_slice()).unwrap();
    assert!(tls.require_client_certificate.unwrap().value);
}

#[tokio::test]
async fn marshal_round_trip_is_byte_identical() {
    let store = Arc::new(InMemoryStore::new());
    store.create(mesh(true)).await.unwrap();
    store.create(http_dataplane()).await.unwrap();

    let snapshot = generate(store).await;
    assert!(!snapshot.is_empty());

    for (name, any) in snapshot.clusters.iter() {
        let decoded = Cluster::decode(any.value.as_slice()).unwrap();
        assert_eq!(decoded.encode_to_vec(), any.value, "cluster '{}' round trip", name);
    }
    for (name, any) in snapshot.listeners.iter() {
        let decoded = Listener::decode(any.value.as_slice()).unwrap();
        assert_eq!(decoded.encode_to_vec(), any.value, "listener '{}' round trip", name);
    }
}

#[tokio::test]
async fn identical_stores_generate_identical_snapshots() {
    let seed = |store: Arc<InMemoryStore>| async move {
        store.create(mesh(true)).await.unwrap();
        store.create(http_dataplane()).await.unwrap();
        store
    };

    let store_a = seed(Arc::new(InMemoryStore::new())).await;
    let store_b = seed(Arc::new(InMemoryStore::new())).await;

    let snap_a = generate(store_a).await;
    let snap_b = generate(store_b).await;
    assert_eq!(snap_a.fingerprint(), snap_b.fingerprint());
}
