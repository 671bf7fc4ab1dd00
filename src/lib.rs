//! # Meshplane
//!
//! Meshplane is the multi-zone synchronization and xDS translation core of a
//! service-mesh control plane. A Global control plane pushes mesh-wide policy
//! and secrets down to Zones; Zones push their Dataplanes and insights up.
//! Within a Zone, a per-Dataplane watchdog translates the Dataplane and its
//! applied policies into an Envoy v3 snapshot.
//!
//! ## Core Components
//!
//! - **Snapshot Cache**: node-keyed, versioned Envoy snapshots with watch
//!   streams consumed by the Envoy-facing ADS server
//! - **KDS Server / Sink**: the inter-control-plane configuration bus, a
//!   SOTW discovery protocol over a tonic bidi stream
//! - **xDS Generators**: Dataplane + policies → Clusters, Listeners, Routes
//!   and Secrets
//! - **Ingress Reconciler**: keeps a Zone ingress's `available_services` in
//!   sync with the Zone's workloads

pub mod cache;
pub mod config;
pub mod core;
pub mod errors;
pub mod ingress;
pub mod kds;
pub mod observability;
pub mod runtime;
pub mod startup;
pub mod store;
pub mod xds;

// Re-export commonly used types and traits
pub use config::AppConfig;
pub use errors::{Error, MeshplaneError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_looks_like_semver() {
        let components: Vec<_> = VERSION.split('.').collect();
        assert!(components.len() >= 3, "version should follow semver: {VERSION}");
        assert!(components.iter().all(|part| !part.is_empty()));
        assert_eq!(APP_NAME, "meshplane");
    }
}
