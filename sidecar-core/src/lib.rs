//! Sidecar Core Library
//!
//! A local gRPC sidecar that sits between a build client and two remote
//! backends: a build-event ingestion service and a remote
//! content-addressable cache. The client talks to one fixed local
//! address; the sidecar relays every call upstream while preserving
//! streaming semantics, status codes and resource bounds.

pub mod auth;
pub mod backends;
pub mod bes_proxy;
pub mod cache_proxy;

/// Configuration types and utilities
pub mod config;

/// Error types for sidecar startup
pub mod error;

/// Liveness state and graceful drain
pub mod health;

pub mod interceptor;
pub mod relay;
pub mod server;

pub use auth::{Authenticator, NoopAuthenticator};
pub use backends::{BackendConnections, BackendRole};
pub use bes_proxy::BuildEventProxy;
pub use cache_proxy::CacheProxy;
pub use config::{BesTarget, ListenAddr, SidecarConfig, DEFAULT_MAX_MESSAGE_BYTES};
pub use error::SidecarError;
pub use health::HealthChecker;
pub use interceptor::RequestGuard;
pub use server::{BoundSidecar, SidecarServer};

/// Result type alias for sidecar operations
pub type Result<T> = std::result::Result<T, SidecarError>;

pub mod pb {
    pub mod publish_build_event {
        tonic::include_proto!("publish_build_event");
    }
    pub mod bytestream {
        tonic::include_proto!("bytestream");
    }
    pub mod remote_execution {
        tonic::include_proto!("remote_execution");
    }

    /// Descriptor set for the three packages above, served via gRPC
    /// server reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("sidecar_descriptor");
}
