//! Inputs to one generation run: control plane facts, the mesh cut, and the
//! proxy (Dataplane + matched policies).

use crate::core::mesh::MeshSpec;
use crate::core::resource::{Resource, ResourceKey};
use crate::errors::Result;
use crate::xds::matcher::MatchedPolicies;

/// Facts about the control plane itself, needed to point sidecars at SDS.
#[derive(Debug, Clone, Default)]
pub struct ControlPlaneContext {
    /// host:port of the SDS endpoint.
    pub sds_location: String,
    /// PEM bundle the sidecar uses to verify the SDS endpoint.
    pub sds_tls_cert: Vec<u8>,
}

/// One mesh's state, taken as a consistent cut.
#[derive(Debug, Clone)]
pub struct MeshContext {
    pub mesh: Resource,
    /// All Dataplanes of the mesh, ingresses included; endpoint resolution
    /// for outbound clusters reads these.
    pub dataplanes: Vec<Resource>,
    /// All policies of the mesh, every kind together.
    pub policies: Vec<Resource>,
}

impl MeshContext {
    pub fn mesh_name(&self) -> &str {
        &self.mesh.meta.name
    }

    pub fn mesh_spec(&self) -> Result<&MeshSpec> {
        self.mesh.as_mesh()
    }
}

#[derive(Debug, Clone)]
pub struct XdsContext {
    pub control_plane: ControlPlaneContext,
    pub mesh: MeshContext,
}

/// Per-dataplane metadata reported at registration.
#[derive(Debug, Clone, Default)]
pub struct DataplaneMetadata {
    /// Path to the dataplane token file; attaches call credentials to SDS.
    pub dataplane_token_path: Option<String>,
}

/// The unit of generation: one Dataplane with its resolved policies.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub id: ResourceKey,
    pub dataplane: Resource,
    pub metadata: DataplaneMetadata,
    pub policies: MatchedPolicies,
}
