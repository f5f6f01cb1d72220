use crate::Args;
use sidecar_core::config::ListenAddr;
use sidecar_core::error::SidecarError;

fn base_args() -> Args {
    Args {
        server_type: "sidecar".to_string(),
        listen_addr: "localhost:1991".to_string(),
        bes_backends: vec![],
        bes_best_effort_backends: vec![],
        remote_cache: String::new(),
        max_message_size_bytes: 4 * 1024 * 1024,
    }
}

#[test]
fn no_backend_is_a_startup_error() {
    let result = base_args().into_config();
    assert!(matches!(result, Err(SidecarError::NoBackendConfigured)));
}

#[test]
fn cache_only_configuration() {
    let args = Args {
        remote_cache: "grpcs://cloud.example.com:443".to_string(),
        ..base_args()
    };
    let config = args.into_config().unwrap();
    assert!(config.bes_backends.is_empty());
    assert_eq!(
        config.remote_cache.as_deref(),
        Some("grpcs://cloud.example.com:443")
    );
}

#[test]
fn bes_only_configuration() {
    let args = Args {
        bes_backends: vec!["grpcs://bes.example.com:443".to_string()],
        ..base_args()
    };
    let config = args.into_config().unwrap();
    assert!(config.remote_cache.is_none());
    assert_eq!(config.bes_backends.len(), 1);
    assert!(!config.bes_backends[0].best_effort);
}

#[test]
fn mandatory_targets_come_before_best_effort() {
    let args = Args {
        bes_backends: vec!["grpc://primary:1985".to_string()],
        bes_best_effort_backends: vec!["grpc://mirror:1985".to_string()],
        ..base_args()
    };
    let config = args.into_config().unwrap();
    assert_eq!(config.bes_backends.len(), 2);
    assert_eq!(config.bes_backends[0].address, "grpc://primary:1985");
    assert!(!config.bes_backends[0].best_effort);
    assert_eq!(config.bes_backends[1].address, "grpc://mirror:1985");
    assert!(config.bes_backends[1].best_effort);
}

#[test]
fn empty_backend_flags_are_dropped() {
    let args = Args {
        bes_backends: vec![String::new(), "grpc://bes:1985".to_string()],
        bes_best_effort_backends: vec![String::new()],
        ..base_args()
    };
    let config = args.into_config().unwrap();
    assert_eq!(config.bes_backends.len(), 1);
}

#[test]
fn unix_listen_addr_parses() {
    let args = Args {
        listen_addr: "unix:///tmp/sidecar.sock".to_string(),
        remote_cache: "grpc://localhost:1985".to_string(),
        ..base_args()
    };
    let config = args.into_config().unwrap();
    assert!(matches!(config.listen_addr, ListenAddr::Unix(_)));
}

#[test]
fn bad_listen_addr_is_rejected() {
    let args = Args {
        listen_addr: "not-an-address".to_string(),
        remote_cache: "grpc://localhost:1985".to_string(),
        ..base_args()
    };
    assert!(matches!(
        args.into_config(),
        Err(SidecarError::InvalidConfig(_))
    ));
}
