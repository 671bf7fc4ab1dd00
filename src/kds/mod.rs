//! KDS: the bidirectional configuration bus between Global and Zone control
//! planes.
//!
//! Both sides speak the same SOTW discovery protocol over the envoy ADS
//! bidi RPC: Global pushes mesh-wide policy and secrets down, Zones push
//! their Dataplanes and insights up. Payloads ride in `Any`-wrapped
//! `KdsResource` envelopes.

pub mod global;
pub mod rewrite;
pub mod server;
pub mod sink;
pub mod wire;
pub mod zone;

pub use server::{KdsServer, KdsServerConfig, ProvidedFilter};
pub use sink::{KdsSink, SinkCallbacks, SyncCallbacks};
