//! Error types for sidecar startup.
//!
//! Everything in [`SidecarError`] is startup-fatal: the process logs
//! the error and exits non-zero, never retrying. Runtime relay failures
//! are expressed as a `tonic::Status` on the affected call instead, so
//! one bad call never takes the process down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SidecarError {
    /// Configuration that can be rejected without any I/O.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Neither backend role was configured.
    #[error("no services configured: at least one of --bes_backend or --remote_cache must be provided")]
    NoBackendConfigured,

    /// A backend address could not be parsed into an endpoint.
    #[error("invalid {role} backend address {address:?}: {source}")]
    InvalidBackendAddress {
        role: &'static str,
        address: String,
        source: tonic::transport::Error,
    },

    /// Dialing a backend at startup failed.
    #[error("failed to dial {role} backend at {address:?}: {source}")]
    BackendDial {
        role: &'static str,
        address: String,
        source: tonic::transport::Error,
    },

    /// Binding the local listener failed.
    #[error("failed to listen on {address:?}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// The reflection service could not be built from the compiled
    /// descriptor set.
    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// The gRPC server itself failed while serving.
    #[error("gRPC server error: {0}")]
    Serve(#[from] tonic::transport::Error),
}
