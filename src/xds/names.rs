//! Naming conventions for generated Envoy resources.

/// Cluster pointing at the local workload behind an inbound.
pub fn local_cluster_name(workload_port: u32) -> String {
    format!("localhost:{}", workload_port)
}

/// Listener accepting traffic for one inbound.
pub fn inbound_listener_name(dataplane_ip: &str, dataplane_port: u32) -> String {
    format!("inbound:{}:{}", dataplane_ip, dataplane_port)
}

/// Listener originating traffic for one outbound.
pub fn outbound_listener_name(address: &str, port: u32) -> String {
    format!("outbound:{}:{}", address, port)
}

/// Cluster toward a destination service, optionally disambiguated by a split
/// index when one service appears in several weighted destinations.
pub fn service_cluster_name(service: &str, split_index: Option<usize>) -> String {
    match split_index {
        Some(i) => format!("{}-_{}_", service, i),
        None => service.to_string(),
    }
}

/// Stat-safe name: Envoy metric segments must not contain ':' or '.'.
pub fn sanitize_stat_name(name: &str) -> String {
    name.replace([':', '.'], "_")
}
