//! Listener setup and gRPC service wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Server;
use tracing::info;

use crate::auth::Authenticator;
use crate::backends::{BackendConnections, BackendRole};
use crate::bes_proxy::BuildEventProxy;
use crate::cache_proxy::CacheProxy;
use crate::config::{ListenAddr, SidecarConfig};
use crate::error::SidecarError;
use crate::health::HealthChecker;
use crate::interceptor::RequestGuard;
use crate::pb::bytestream::byte_stream_server::ByteStreamServer;
use crate::pb::publish_build_event::publish_build_event_server::PublishBuildEventServer;
use crate::pb::remote_execution::action_cache_server::ActionCacheServer;
use crate::pb::remote_execution::capabilities_server::CapabilitiesServer;
use crate::pb::remote_execution::content_addressable_storage_server::ContentAddressableStorageServer;

/// The assembled sidecar: listener, interceptor chain and the proxy
/// services for whichever backend roles are configured.
pub struct SidecarServer {
    config: SidecarConfig,
    health: Arc<HealthChecker>,
    authenticator: Arc<dyn Authenticator>,
    backends: BackendConnections,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A sidecar whose listener is bound and ready to accept.
pub struct BoundSidecar {
    server: SidecarServer,
    listener: Listener,
}

impl SidecarServer {
    /// Validate the configuration and dial every backend. Fails fast;
    /// nothing here is retried at runtime.
    pub async fn connect(
        config: SidecarConfig,
        authenticator: Arc<dyn Authenticator>,
        health: Arc<HealthChecker>,
    ) -> Result<Self, SidecarError> {
        config.validate()?;
        let backends = BackendConnections::connect(&config).await?;
        Ok(Self {
            config,
            health,
            authenticator,
            backends,
        })
    }

    /// Bind the local listener. Bind failure is startup-fatal.
    pub async fn bind(self) -> Result<BoundSidecar, SidecarError> {
        let listener = match &self.config.listen_addr {
            ListenAddr::Tcp(addr) => {
                let listener =
                    TcpListener::bind(addr)
                        .await
                        .map_err(|source| SidecarError::Bind {
                            address: addr.clone(),
                            source,
                        })?;
                info!(address = %addr, "gRPC sidecar listening");
                Listener::Tcp(listener)
            }
            ListenAddr::Unix(path) => {
                // A previous run may have left the socket file behind.
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).map_err(|source| SidecarError::Bind {
                    address: path.display().to_string(),
                    source,
                })?;
                info!(path = %path.display(), "gRPC sidecar listening on unix socket");
                Listener::Unix(listener)
            }
        };
        Ok(BoundSidecar {
            server: self,
            listener,
        })
    }

    /// Bind and serve until a drain completes.
    pub async fn run(self) -> Result<(), SidecarError> {
        self.bind().await?.serve().await
    }
}

impl BoundSidecar {
    /// Actual bound TCP address; useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    /// Serve until the health checker begins a drain, then let
    /// in-flight streams finish and close the listener.
    pub async fn serve(self) -> Result<(), SidecarError> {
        let BoundSidecar { server, listener } = self;
        let guard = RequestGuard::new(server.authenticator.clone(), server.health.clone());
        let max = server.config.max_message_bytes;

        // Payload-bearing messages are size-checked inside the proxies,
        // which report violations as RESOURCE_EXHAUSTED; the transport
        // decode caps stay out of the way so they never reject first
        // with a different code.
        let bes_service = server.backends.is_configured(BackendRole::BuildEvent).then(|| {
            info!(
                targets = server.backends.bes_backends().len(),
                "registering build-event proxy"
            );
            let proxy = BuildEventProxy::new(server.backends.bes_backends().to_vec(), max);
            let service = PublishBuildEventServer::new(proxy).max_decoding_message_size(usize::MAX);
            InterceptedService::new(service, guard.clone())
        });

        let cache = server.backends.cache_channel();
        if cache.is_some() {
            info!("registering cache proxy");
        }
        let bytestream_service = cache.clone().map(|channel| {
            let service = ByteStreamServer::new(CacheProxy::new(channel, max))
                .max_decoding_message_size(usize::MAX);
            InterceptedService::new(service, guard.clone())
        });
        let action_cache_service = cache.clone().map(|channel| {
            let service = ActionCacheServer::new(CacheProxy::new(channel, max))
                .max_decoding_message_size(usize::MAX);
            InterceptedService::new(service, guard.clone())
        });
        let cas_service = cache.clone().map(|channel| {
            let service = ContentAddressableStorageServer::new(CacheProxy::new(channel, max))
                .max_decoding_message_size(usize::MAX);
            InterceptedService::new(service, guard.clone())
        });
        let capabilities_service = cache.map(|channel| {
            let service = CapabilitiesServer::new(CacheProxy::new(channel, max))
                .max_decoding_message_size(max);
            InterceptedService::new(service, guard.clone())
        });

        // Reflection is registered unconditionally so grpcurl and
        // similar tools can list the proxied services.
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(crate::pb::FILE_DESCRIPTOR_SET)
            .build()?;

        let router = Server::builder()
            .add_service(reflection_service)
            .add_optional_service(bes_service)
            .add_optional_service(bytestream_service)
            .add_optional_service(action_cache_service)
            .add_optional_service(cas_service)
            .add_optional_service(capabilities_service);

        let health = server.health.clone();
        let shutdown = async move { health.drained().await };

        match listener {
            Listener::Tcp(listener) => {
                router
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                    .await?;
            }
            Listener::Unix(listener) => {
                router
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                    .await?;
            }
        }

        server.health.run_shutdown_hooks();
        info!("sidecar drained, listener closed");
        Ok(())
    }
}
