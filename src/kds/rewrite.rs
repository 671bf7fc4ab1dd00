//! Transformations applied to batches received from a peer before they are
//! written to the local store.

use tracing::debug;

use crate::core::resource::{Resource, ResourceSpec};
use crate::errors::{Error, Result};

/// Rewrite every name to `original.peerId`. A Kubernetes-backed store gets
/// an extra `.default` suffix: the store parses the substring after the last
/// dot as the namespace.
pub fn rewrite_names(resources: &mut [Resource], peer_id: &str, k8s_store: bool) {
    for resource in resources.iter_mut() {
        resource.meta.name = format!("{}.{}", resource.meta.name, peer_id);
        if k8s_store {
            resource.meta.name.push_str(".default");
        }
    }
}

/// Keep at most one Ingress Dataplane, preserving order; non-ingress
/// Dataplanes pass through untouched. The caller sorts the batch by
/// `(mesh, name)` first so "first seen" does not depend on peer stream
/// order.
pub fn dedup_ingresses(resources: Vec<Resource>) -> Vec<Resource> {
    let mut ingress_picked = false;
    let mut out = Vec::with_capacity(resources.len());
    for resource in resources {
        let is_ingress = match &resource.spec {
            ResourceSpec::Dataplane(dp) => dp.is_ingress(),
            _ => false,
        };
        if !is_ingress {
            out.push(resource);
            continue;
        }
        if !ingress_picked {
            out.push(resource);
            ingress_picked = true;
        } else {
            debug!(name = %resource.meta.name, "Dropped surplus ingress dataplane");
        }
    }
    out
}

/// Overwrite each Ingress Dataplane's advertised networking with the
/// configured public ingress address of the peer zone. Ingress dataplanes
/// have exactly one inbound.
pub fn adjust_ingress_networking(resources: &mut [Resource], host: &str, port: u32) {
    for resource in resources.iter_mut() {
        let ResourceSpec::Dataplane(dp) = &mut resource.spec else { continue };
        if dp.is_ingress() {
            dp.networking.address = host.to_string();
            if let Some(inbound) = dp.networking.inbound.first_mut() {
                inbound.port = port;
            }
        }
    }
}

/// Split a configured `host:port` ingress address. Validated once at config
/// load; this re-parse exists for callers holding the raw string.
pub fn parse_ingress_address(address: &str) -> Result<(String, u32)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::config(format!("ingress address '{}' is not host:port", address)))?;
    if host.is_empty() {
        return Err(Error::config(format!("ingress address '{}' has an empty host", address)));
    }
    let port = port
        .parse::<u32>()
        .map_err(|_| Error::config(format!("ingress address '{}' has an invalid port", address)))?;
    Ok((host.to_string(), port))
}
