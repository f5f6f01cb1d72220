//! Sidecar Binary Entry Point

use std::sync::Arc;

use clap::Parser;
use sidecar::{run_sidecar, Args};
use sidecar_core::health::HealthChecker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sidecar=info,sidecar_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let health = Arc::new(HealthChecker::new(args.server_type.clone()));

    // An external shutdown signal starts the drain; the server keeps
    // running until in-flight streams have finished.
    let signal_health = health.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, draining...");
            signal_health.begin_drain();
        }
    });

    if let Err(e) = run_sidecar(args, health).await {
        tracing::error!("sidecar failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}
