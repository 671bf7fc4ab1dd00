//! The generation pipeline.
//!
//! Each generator is a value exposing a single `generate(ctx, proxy)`; the
//! pipeline is a fixed sequence of such values, run in order into one
//! `ResourceSet`.

pub mod inbound;
pub mod outbound;

pub use inbound::InboundProxyGenerator;
pub use outbound::OutboundProxyGenerator;

use crate::errors::Result;
use crate::xds::context::{Proxy, XdsContext};
use crate::xds::resources::ResourceSet;

pub trait SnapshotGenerator: Send + Sync {
    fn generate(&self, ctx: &XdsContext, proxy: &Proxy) -> Result<ResourceSet>;
}

/// The fixed generator sequence applied to every proxy.
pub struct GeneratorPipeline {
    generators: Vec<Box<dyn SnapshotGenerator>>,
}

impl GeneratorPipeline {
    /// The default pipeline: inbound first, then outbound.
    pub fn standard() -> Self {
        Self {
            generators: vec![
                Box::new(InboundProxyGenerator),
                Box::new(OutboundProxyGenerator),
            ],
        }
    }

    pub fn generate(&self, ctx: &XdsContext, proxy: &Proxy) -> Result<ResourceSet> {
        let mut resources = ResourceSet::new();
        for generator in &self.generators {
            resources.extend(generator.generate(ctx, proxy)?);
        }
        Ok(resources)
    }
}
