//! TLS contexts for mesh mTLS.
//!
//! Inbound listeners require client certificates signed by the mesh CA with
//! a URI SAN under `spiffe://<mesh>/`; outbound clusters validate the
//! upstream the same way, pinned to the exact service identity unless the
//! upstream is the `*` mesh wildcard. Certificate material is fetched over
//! SDS; the SDS channel itself is authenticated with the control plane's
//! certs plus an optional file-based dataplane token.

use envoy_types::pb::envoy::config::core::v3::{
    api_config_source::ApiType, config_source::ConfigSourceSpecifier, data_source::Specifier,
    grpc_service, ApiConfigSource, ApiVersion, ConfigSource, DataSource, GrpcService,
};
use envoy_types::pb::envoy::config::grpc_credential::v3::FileBasedMetadataConfig;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context, subject_alt_name_matcher::SanType, CertificateValidationContext,
    CommonTlsContext, DownstreamTlsContext, SdsSecretConfig, SubjectAltNameMatcher,
    UpstreamTlsContext,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher, StringMatcher};
use envoy_types::pb::google::protobuf::BoolValue;

use crate::errors::Result;
use crate::xds::context::{DataplaneMetadata, XdsContext};
use crate::xds::names::sanitize_stat_name;
use crate::xds::resources::pack_any;

/// SDS resource holding the mesh CA bundle.
pub const MESH_CA_RESOURCE: &str = "mesh_ca";

/// SDS resource holding the dataplane's identity certificate.
pub const IDENTITY_CERT_RESOURCE: &str = "identity_cert";

const FILE_BASED_METADATA_PLUGIN: &str = "envoy.grpc_credentials.file_based_metadata";

const FILE_BASED_METADATA_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.grpc_credential.v3.FileBasedMetadataConfig";

pub fn mesh_spiffe_id_prefix(mesh: &str) -> String {
    format!("spiffe://{}/", mesh)
}

pub fn service_spiffe_id(mesh: &str, service: &str) -> String {
    format!("spiffe://{}/{}", mesh, service)
}

pub fn mesh_spiffe_id_prefix_matcher(mesh: &str) -> StringMatcher {
    StringMatcher {
        match_pattern: Some(string_matcher::MatchPattern::Prefix(mesh_spiffe_id_prefix(mesh))),
        ..Default::default()
    }
}

pub fn service_spiffe_id_matcher(mesh: &str, service: &str) -> StringMatcher {
    StringMatcher {
        match_pattern: Some(string_matcher::MatchPattern::Exact(service_spiffe_id(mesh, service))),
        ..Default::default()
    }
}

/// Downstream (inbound) TLS context. `None` when the mesh has mTLS off.
pub fn create_downstream_tls_context(
    ctx: &XdsContext,
    metadata: &DataplaneMetadata,
) -> Result<Option<DownstreamTlsContext>> {
    if !ctx.mesh.mesh_spec()?.mtls_enabled() {
        return Ok(None);
    }
    let validation_san_matcher = mesh_spiffe_id_prefix_matcher(ctx.mesh.mesh_name());
    let common = create_common_tls_context(ctx, metadata, validation_san_matcher);
    Ok(Some(DownstreamTlsContext {
        common_tls_context: Some(common),
        require_client_certificate: Some(BoolValue { value: true }),
        ..Default::default()
    }))
}

/// Upstream (outbound) TLS context. `None` when the mesh has mTLS off.
/// `upstream_service == "*"` validates membership of the mesh rather than a
/// specific service.
pub fn create_upstream_tls_context(
    ctx: &XdsContext,
    metadata: &DataplaneMetadata,
    upstream_service: &str,
    sni: &str,
) -> Result<Option<UpstreamTlsContext>> {
    if !ctx.mesh.mesh_spec()?.mtls_enabled() {
        return Ok(None);
    }
    let validation_san_matcher = if upstream_service == "*" {
        mesh_spiffe_id_prefix_matcher(ctx.mesh.mesh_name())
    } else {
        service_spiffe_id_matcher(ctx.mesh.mesh_name(), upstream_service)
    };
    let common = create_common_tls_context(ctx, metadata, validation_san_matcher);
    Ok(Some(UpstreamTlsContext {
        common_tls_context: Some(common),
        sni: sni.to_string(),
        ..Default::default()
    }))
}

fn create_common_tls_context(
    ctx: &XdsContext,
    metadata: &DataplaneMetadata,
    validation_san_matcher: StringMatcher,
) -> CommonTlsContext {
    let mesh_ca = sds_secret_config(ctx, MESH_CA_RESOURCE, metadata);
    let identity = sds_secret_config(ctx, IDENTITY_CERT_RESOURCE, metadata);
    CommonTlsContext {
        validation_context_type: Some(
            common_tls_context::ValidationContextType::CombinedValidationContext(
                common_tls_context::CombinedCertificateValidationContext {
                    default_validation_context: Some(CertificateValidationContext {
                        match_typed_subject_alt_names: vec![SubjectAltNameMatcher {
                            san_type: SanType::Uri as i32,
                            matcher: Some(validation_san_matcher),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    validation_context_sds_secret_config: Some(mesh_ca),
                    ..Default::default()
                },
            ),
        ),
        tls_certificate_sds_secret_configs: vec![identity],
        ..Default::default()
    }
}

/// SDS config dialing the control plane over TLS, with call credentials from
/// the dataplane token file when the metadata carries a path.
fn sds_secret_config(
    ctx: &XdsContext,
    name: &str,
    metadata: &DataplaneMetadata,
) -> SdsSecretConfig {
    let mut google_grpc = grpc_service::GoogleGrpc {
        target_uri: ctx.control_plane.sds_location.clone(),
        stat_prefix: sanitize_stat_name(&format!("sds_{}", name)),
        channel_credentials: Some(grpc_service::google_grpc::ChannelCredentials {
            credential_specifier: Some(
                grpc_service::google_grpc::channel_credentials::CredentialSpecifier::SslCredentials(
                    grpc_service::google_grpc::SslCredentials {
                        root_certs: Some(DataSource {
                            specifier: Some(Specifier::InlineBytes(
                                ctx.control_plane.sds_tls_cert.clone(),
                            )),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ),
            ),
        }),
        ..Default::default()
    };

    if let Some(token_path) = &metadata.dataplane_token_path {
        let plugin_config = FileBasedMetadataConfig {
            secret_data: Some(DataSource {
                specifier: Some(Specifier::Filename(token_path.clone())),
                ..Default::default()
            }),
            ..Default::default()
        };
        google_grpc.call_credentials =
            vec![grpc_service::google_grpc::CallCredentials {
                credential_specifier: Some(
                    grpc_service::google_grpc::call_credentials::CredentialSpecifier::FromPlugin(
                        grpc_service::google_grpc::call_credentials::MetadataCredentialsFromPlugin {
                            name: FILE_BASED_METADATA_PLUGIN.to_string(),
                            config_type: Some(
                                grpc_service::google_grpc::call_credentials::metadata_credentials_from_plugin::ConfigType::TypedConfig(
                                    pack_any(FILE_BASED_METADATA_TYPE_URL, &plugin_config),
                                ),
                            ),
                        },
                    ),
                ),
            }];
        google_grpc.credentials_factory_name = FILE_BASED_METADATA_PLUGIN.to_string();
    }

    SdsSecretConfig {
        name: name.to_string(),
        sds_config: Some(ConfigSource {
            resource_api_version: ApiVersion::V3 as i32,
            config_source_specifier: Some(ConfigSourceSpecifier::ApiConfigSource(
                ApiConfigSource {
                    api_type: ApiType::Grpc as i32,
                    transport_api_version: ApiVersion::V3 as i32,
                    grpc_services: vec![GrpcService {
                        target_specifier: Some(grpc_service::TargetSpecifier::GoogleGrpc(
                            google_grpc,
                        )),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )),
            ..Default::default()
        }),
    }
}
