//! # Error Handling
//!
//! Error types for the meshplane control plane core, built with `thiserror`.
//! Components map every failure into one of these kinds; the recovery policy
//! (retry, backoff, skip-and-keep-last-good) is decided by the caller.

use crate::core::resource::ResourceType;

/// Custom result type for meshplane operations
pub type Result<T> = std::result::Result<T, MeshplaneError>;

/// Main error type for the meshplane control plane
#[derive(thiserror::Error, Debug)]
pub enum MeshplaneError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Resource not found in the store
    #[error("Resource not found: {resource_type} '{mesh}/{name}'")]
    NotFound { resource_type: ResourceType, mesh: String, name: String },

    /// Optimistic concurrency conflict on a store write
    #[error("Resource conflict: {resource_type} '{mesh}/{name}' version mismatch")]
    Conflict { resource_type: ResourceType, mesh: String, name: String },

    /// A resource failed validation or could not be translated
    #[error("Invalid resource: {message}")]
    InvalidResource { message: String },

    /// Network transport errors (gRPC dial, stream reset). Transient by
    /// definition: recovered locally with backoff, never surfaced past the
    /// resilient wrapper.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A peer sent a malformed message or an unknown resource type
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Short alias used throughout the crate
pub type Error = MeshplaneError;

impl MeshplaneError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a not-found error
    pub fn not_found<M: Into<String>, N: Into<String>>(
        resource_type: ResourceType,
        mesh: M,
        name: N,
    ) -> Self {
        Self::NotFound { resource_type, mesh: mesh.into(), name: name.into() }
    }

    /// Create a conflict error
    pub fn conflict<M: Into<String>, N: Into<String>>(
        resource_type: ResourceType,
        mesh: M,
        name: N,
    ) -> Self {
        Self::Conflict { resource_type, mesh: mesh.into(), name: name.into() }
    }

    /// Create an invalid-resource error
    pub fn invalid_resource<S: Into<String>>(message: S) -> Self {
        Self::InvalidResource { message: message.into() }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(
        context: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Serialization { context: context.into(), source: Some(source) }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Whether the error is a store write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether the error is transient and worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for MeshplaneError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { context: "JSON".to_string(), source: Some(Box::new(err)) }
    }
}

impl From<prost::DecodeError> for MeshplaneError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Protocol { message: format!("protobuf decode: {}", err) }
    }
}

impl From<tonic::transport::Error> for MeshplaneError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tonic::Status> for MeshplaneError {
    fn from(status: tonic::Status) -> Self {
        Self::Transport(format!("grpc status {}: {}", status.code(), status.message()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_classified() {
        let err = MeshplaneError::conflict(ResourceType::Dataplane, "default", "backend-1");
        assert!(err.is_conflict());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("default/backend-1"));
    }

    #[test]
    fn transport_is_transient() {
        let err = MeshplaneError::transport("connection refused");
        assert!(err.is_transient());
    }

    #[test]
    fn grpc_status_maps_to_transport() {
        let err: MeshplaneError = tonic::Status::unavailable("upstream connect error").into();
        assert!(err.is_transient());
        assert!(err.to_string().contains("upstream connect error"));
    }
}
