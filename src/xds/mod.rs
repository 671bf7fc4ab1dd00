//! Per-Dataplane Envoy xDS generation.
//!
//! A `DataplaneWatchdog` per local Dataplane assembles mesh + policy context
//! on every tick and emits an Envoy snapshot (Clusters, Listeners, Routes,
//! Secrets) into the snapshot cache keyed by the Dataplane identity.

pub mod cluster;
pub mod context;
pub mod generator;
pub mod listener;
pub mod matcher;
pub mod names;
pub mod resources;
pub mod route;
pub mod tags;
pub mod tls;
pub mod watchdog;

pub use context::{ControlPlaneContext, MeshContext, Proxy, XdsContext};
pub use matcher::{MatchedPolicies, PolicyMatcher};
pub use resources::{ResourceSet, XdsResource};
pub use watchdog::{
    DataplaneWatchdog, DataplaneWatchdogDependencies, DataplaneWatchdogFactory, WatchdogLifecycle,
};
