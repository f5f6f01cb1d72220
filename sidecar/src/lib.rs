//! Sidecar Binary
//!
//! Local gRPC sidecar for build tools: listens on a fixed local
//! address and relays build events and remote-cache traffic to the
//! configured remote backends.

use std::sync::Arc;

use clap::Parser;
use sidecar_core::auth::NoopAuthenticator;
use sidecar_core::config::{BesTarget, ListenAddr, SidecarConfig, DEFAULT_MAX_MESSAGE_BYTES};
use sidecar_core::error::SidecarError;
use sidecar_core::health::HealthChecker;
use sidecar_core::server::SidecarServer;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Server type tag to match on health checks
    #[arg(long, default_value = "sidecar")]
    pub server_type: String,

    /// Local address to listen on: `unix://<path>` or `<host>:<port>`
    #[arg(long, default_value = "localhost:1991")]
    pub listen_addr: String,

    /// Server address to proxy build events to; repeat for fan-out
    #[arg(long = "bes_backend")]
    pub bes_backends: Vec<String>,

    /// Build-event backend whose mid-stream failures are logged instead
    /// of failing the client stream; repeat for fan-out
    #[arg(long = "bes_best_effort_backend")]
    pub bes_best_effort_backends: Vec<String>,

    /// Server address to proxy cache traffic to
    #[arg(long, default_value = "")]
    pub remote_cache: String,

    /// Maximum inbound/relayed gRPC message size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_size_bytes: usize,
}

impl Args {
    /// Turn the raw flags into a validated startup configuration.
    pub fn into_config(self) -> Result<SidecarConfig, SidecarError> {
        let listen_addr: ListenAddr = self.listen_addr.parse()?;

        let mut bes_backends: Vec<BesTarget> = self
            .bes_backends
            .into_iter()
            .filter(|address| !address.is_empty())
            .map(BesTarget::mandatory)
            .collect();
        bes_backends.extend(
            self.bes_best_effort_backends
                .into_iter()
                .filter(|address| !address.is_empty())
                .map(BesTarget::best_effort),
        );

        let remote_cache = if self.remote_cache.is_empty() {
            None
        } else {
            Some(self.remote_cache)
        };

        let config = SidecarConfig {
            server_type: self.server_type,
            listen_addr,
            bes_backends,
            remote_cache,
            max_message_bytes: self.max_message_size_bytes,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod config_test;

/// Dial backends, bind the listener and serve until `health` completes
/// a drain.
pub async fn run_sidecar(args: Args, health: Arc<HealthChecker>) -> Result<(), SidecarError> {
    let config = args.into_config()?;

    tracing::info!("starting sidecar");
    tracing::info!("  listen:       {}", config.listen_addr);
    for target in &config.bes_backends {
        tracing::info!(
            "  bes backend:  {}{}",
            target.address,
            if target.best_effort {
                " (best-effort)"
            } else {
                ""
            }
        );
    }
    if let Some(cache) = &config.remote_cache {
        tracing::info!("  remote cache: {}", cache);
    }

    let server = SidecarServer::connect(config, Arc::new(NoopAuthenticator), health).await?;
    server.run().await
}
