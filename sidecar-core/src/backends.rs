//! Long-lived connections to the configured remote backends.

use tonic::transport::{Channel, Endpoint};
use tracing::info;

use crate::config::SidecarConfig;
use crate::error::SidecarError;

/// Which remote a relayed call is bound for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    BuildEvent,
    Cache,
}

impl BackendRole {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendRole::BuildEvent => "build-event",
            BackendRole::Cache => "cache",
        }
    }
}

/// A dialed build-event target: its channel plus the fan-out policy.
#[derive(Debug, Clone)]
pub struct BesBackend {
    pub address: String,
    pub channel: Channel,
    pub best_effort: bool,
}

/// Holds the outbound connections for the process lifetime.
///
/// Targets are dialed exactly once at startup and never redialed; new
/// streams are multiplexed over the existing channels. A connection
/// that drops later surfaces as UNAVAILABLE on the affected calls
/// only, never as a process error.
#[derive(Debug)]
pub struct BackendConnections {
    bes: Vec<BesBackend>,
    cache: Option<Channel>,
}

impl BackendConnections {
    /// Dial every configured backend. Any dial failure is fatal.
    pub async fn connect(config: &SidecarConfig) -> Result<Self, SidecarError> {
        let mut bes = Vec::with_capacity(config.bes_backends.len());
        for target in &config.bes_backends {
            let channel = dial(BackendRole::BuildEvent, &target.address).await?;
            info!(
                address = %target.address,
                best_effort = target.best_effort,
                "connected to build-event backend"
            );
            bes.push(BesBackend {
                address: target.address.clone(),
                channel,
                best_effort: target.best_effort,
            });
        }

        let cache = match &config.remote_cache {
            Some(address) => {
                let channel = dial(BackendRole::Cache, address).await?;
                info!(address = %address, "connected to cache backend");
                Some(channel)
            }
            None => None,
        };

        Ok(Self { bes, cache })
    }

    pub fn is_configured(&self, role: BackendRole) -> bool {
        match role {
            BackendRole::BuildEvent => !self.bes.is_empty(),
            BackendRole::Cache => self.cache.is_some(),
        }
    }

    /// Build-event targets in fan-out order (first target is primary).
    pub fn bes_backends(&self) -> &[BesBackend] {
        &self.bes
    }

    /// The shared cache channel; cheap to clone, one per proxied call.
    pub fn cache_channel(&self) -> Option<Channel> {
        self.cache.clone()
    }
}

/// Normalize the `grpc://` / `grpcs://` scheme prefixes build tools use
/// for backend addresses into the HTTP schemes tonic expects. A bare
/// `host:port` is treated as plaintext.
fn normalize_scheme(address: &str) -> String {
    if let Some(rest) = address.strip_prefix("grpcs://") {
        format!("https://{}", rest)
    } else if let Some(rest) = address.strip_prefix("grpc://") {
        format!("http://{}", rest)
    } else if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

async fn dial(role: BackendRole, address: &str) -> Result<Channel, SidecarError> {
    let endpoint = Endpoint::from_shared(normalize_scheme(address)).map_err(|source| {
        SidecarError::InvalidBackendAddress {
            role: role.as_str(),
            address: address.to_string(),
            source,
        }
    })?;
    endpoint
        .connect()
        .await
        .map_err(|source| SidecarError::BackendDial {
            role: role.as_str(),
            address: address.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BesTarget;

    #[test]
    fn normalizes_grpc_schemes() {
        assert_eq!(
            normalize_scheme("grpcs://cloud.example.com:443"),
            "https://cloud.example.com:443"
        );
        assert_eq!(
            normalize_scheme("grpc://localhost:1985"),
            "http://localhost:1985"
        );
        assert_eq!(
            normalize_scheme("https://cloud.example.com"),
            "https://cloud.example.com"
        );
        assert_eq!(normalize_scheme("localhost:1985"), "http://localhost:1985");
    }

    #[tokio::test]
    async fn dial_failure_is_fatal() {
        // Nothing listens on this port; connect() must fail eagerly.
        let config = SidecarConfig {
            bes_backends: vec![BesTarget::mandatory("grpc://127.0.0.1:1")],
            ..Default::default()
        };
        let err = BackendConnections::connect(&config).await.unwrap_err();
        assert!(matches!(err, SidecarError::BackendDial { .. }));
    }
}
