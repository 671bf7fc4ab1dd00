//! The KDS payload envelope.
//!
//! Resources cross zone boundaries as `google.protobuf.Any` values wrapping
//! a small envelope with the resource identity and its canonical-JSON spec.
//! The envelope is a hand-derived prost message; the spec JSON is already
//! deterministic, so two encodes of the same state are byte-identical and
//! usable for push-on-change comparison.

use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::core::resource::{Resource, ResourceSpec, ResourceType};
use crate::errors::{Error, Result};

/// Type URL prefix for KDS payloads.
pub const KDS_TYPE_URL_PREFIX: &str = "type.meshplane.io/";

pub fn type_url_for(resource_type: ResourceType) -> String {
    format!("{}{}", KDS_TYPE_URL_PREFIX, resource_type)
}

pub fn type_from_url(type_url: &str) -> Result<ResourceType> {
    type_url
        .strip_prefix(KDS_TYPE_URL_PREFIX)
        .ok_or_else(|| Error::protocol(format!("unexpected type url '{}'", type_url)))?
        .parse()
}

/// Wire form of one resource.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KdsResource {
    #[prost(string, tag = "1")]
    pub mesh: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub version: String,
    /// Canonical JSON of the spec body.
    #[prost(bytes = "vec", tag = "4")]
    pub spec: Vec<u8>,
}

/// Encode resources of one type, sorted by `(mesh, name)` so repeated
/// encodes of the same state compare equal.
pub fn encode_resources(resource_type: ResourceType, resources: &[Resource]) -> Result<Vec<Any>> {
    let mut sorted: Vec<&Resource> = resources.iter().collect();
    sorted.sort_by_key(|r| r.key());

    let type_url = type_url_for(resource_type);
    sorted
        .into_iter()
        .map(|resource| {
            let envelope = KdsResource {
                mesh: resource.meta.mesh.clone(),
                name: resource.meta.name.clone(),
                version: resource.meta.version.to_string(),
                spec: resource.spec.to_json()?,
            };
            Ok(Any { type_url: type_url.clone(), value: envelope.encode_to_vec() })
        })
        .collect()
}

/// Decode a received batch of one type.
pub fn decode_resources(resource_type: ResourceType, resources: &[Any]) -> Result<Vec<Resource>> {
    let expected_url = type_url_for(resource_type);
    resources
        .iter()
        .map(|any| {
            if any.type_url != expected_url {
                return Err(Error::protocol(format!(
                    "resource type url '{}' does not match subscription '{}'",
                    any.type_url, expected_url
                )));
            }
            let envelope = KdsResource::decode(any.value.as_slice())?;
            let spec = ResourceSpec::from_json(resource_type, &envelope.spec)?;
            Ok(Resource::new(&envelope.mesh, &envelope.name, spec))
        })
        .collect()
}

/// Deterministic fingerprint of an encoded batch; drives push-on-change.
pub fn batch_fingerprint(resources: &[Any]) -> Vec<u8> {
    let mut out = Vec::new();
    for any in resources {
        out.extend_from_slice(any.type_url.as_bytes());
        out.push(0);
        out.extend_from_slice(&(any.value.len() as u64).to_be_bytes());
        out.extend_from_slice(&any.value);
    }
    out
}
