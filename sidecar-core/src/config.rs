//! Configuration types and utilities

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SidecarError;

/// Default maximum size of a single inbound or relayed gRPC message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Where the sidecar listens for client connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenAddr {
    /// TCP `<host>:<port>`.
    Tcp(String),
    /// Unix domain socket, given as `unix://<path>`.
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = SidecarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(SidecarError::InvalidConfig(
                    "unix listen address is missing a socket path".to_string(),
                ));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if s.contains(':') {
            Ok(ListenAddr::Tcp(s.to_string()))
        } else {
            Err(SidecarError::InvalidConfig(format!(
                "listen address {:?} is neither unix://<path> nor <host>:<port>",
                s
            )))
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A build-event fan-out target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BesTarget {
    pub address: String,
    /// A best-effort target may fail mid-stream without failing the
    /// client stream. Targets are mandatory unless configured otherwise.
    pub best_effort: bool,
}

impl BesTarget {
    pub fn mandatory(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            best_effort: false,
        }
    }

    pub fn best_effort(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            best_effort: true,
        }
    }
}

/// Static sidecar startup configuration.
///
/// Built once at startup and passed by reference into each component's
/// constructor; no component reads process-wide state at call time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    /// Identity tag the health subsystem uses to classify this process.
    pub server_type: String,
    /// Local address clients connect to.
    pub listen_addr: ListenAddr,
    /// Build-event backends in fan-out order. The first target is the
    /// primary: its acks are relayed back to the client.
    pub bes_backends: Vec<BesTarget>,
    /// Remote cache backend address. `None` disables the cache proxy.
    pub remote_cache: Option<String>,
    /// Maximum size of a single inbound or relayed message, in bytes.
    pub max_message_bytes: usize,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            server_type: "sidecar".to_string(),
            listen_addr: ListenAddr::Tcp("localhost:1991".to_string()),
            bes_backends: Vec::new(),
            remote_cache: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl SidecarConfig {
    /// Check the startup invariants that need no I/O.
    pub fn validate(&self) -> Result<(), SidecarError> {
        if self.bes_backends.is_empty() && self.remote_cache.is_none() {
            return Err(SidecarError::NoBackendConfigured);
        }
        if self.max_message_bytes == 0 {
            return Err(SidecarError::InvalidConfig(
                "max_message_size_bytes must be non-zero".to_string(),
            ));
        }
        if let Some(target) = self.bes_backends.iter().find(|t| t.address.is_empty()) {
            return Err(SidecarError::InvalidConfig(format!(
                "empty build-event backend address (best_effort: {})",
                target.best_effort
            )));
        }
        if matches!(self.remote_cache.as_deref(), Some("")) {
            return Err(SidecarError::InvalidConfig(
                "empty remote cache address".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_listen_addr() {
        let addr: ListenAddr = "localhost:1991".parse().unwrap();
        assert_eq!(addr, ListenAddr::Tcp("localhost:1991".to_string()));
        assert_eq!(addr.to_string(), "localhost:1991");
    }

    #[test]
    fn parse_unix_listen_addr() {
        let addr: ListenAddr = "unix:///tmp/sidecar.sock".parse().unwrap();
        assert_eq!(addr, ListenAddr::Unix(PathBuf::from("/tmp/sidecar.sock")));
        assert_eq!(addr.to_string(), "unix:///tmp/sidecar.sock");
    }

    #[test]
    fn reject_listen_addr_without_port_or_scheme() {
        assert!("localhost".parse::<ListenAddr>().is_err());
        assert!("unix://".parse::<ListenAddr>().is_err());
    }

    #[test]
    fn validate_requires_a_backend() {
        let config = SidecarConfig::default();
        assert!(matches!(
            config.validate(),
            Err(SidecarError::NoBackendConfigured)
        ));
    }

    #[test]
    fn validate_accepts_single_role() {
        let config = SidecarConfig {
            remote_cache: Some("grpcs://cache.example.com:443".to_string()),
            ..Default::default()
        };
        config.validate().unwrap();

        let config = SidecarConfig {
            bes_backends: vec![BesTarget::mandatory("grpc://bes.example.com:1985")],
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_message_size() {
        let config = SidecarConfig {
            remote_cache: Some("grpc://localhost:1985".to_string()),
            max_message_bytes: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SidecarError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_addresses() {
        let config = SidecarConfig {
            bes_backends: vec![BesTarget::best_effort("")],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SidecarConfig {
            remote_cache: Some(String::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
