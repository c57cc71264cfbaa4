//! Fleet Coordination Server
//!
//! This binary runs the standalone coordination server for a federated
//! training fleet.
//!
//! # Usage
//!
//! ```bash
//! # Start coordinator with default settings
//! fleet-coordinator
//!
//! # Start with custom port and project name
//! fleet-coordinator --port 6008 --project-name medical-fleet
//!
//! # Start in HA mode with snapshot recovery
//! fleet-coordinator --ha-mode --workspace /var/lib/fleet
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use fleet_core::engine::InMemoryJobEngine;
use fleet_core::overseer::StaticOverseer;
use fleet_core::snapshot::FileSnapshotStore;
use fleet_core::transport::LoopbackTransport;
use fleet_core::{FederatedServer, ServerConfig};

/// Fleet Coordination Server
#[derive(Parser, Debug)]
#[command(name = "fleet-coordinator")]
#[command(about = "Coordination server for federated training fleets")]
struct Args {
    /// Project name reported to clients
    #[arg(long)]
    project_name: Option<String>,

    /// Port to advertise
    #[arg(short, long, default_value = "6007")]
    port: u16,

    /// Address to advertise
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,

    /// Maximum number of registered clients
    #[arg(long, default_value = "100")]
    max_clients: usize,

    /// Heartbeat timeout in seconds
    #[arg(long, default_value = "600")]
    heartbeat_timeout: u64,

    /// Require challenge/response client authentication
    #[arg(long)]
    secure_mode: bool,

    /// Resume jobs from durable snapshots on promotion
    #[arg(long)]
    ha_mode: bool,

    /// Workspace root for run directories and snapshots
    #[arg(long, default_value = "workspace")]
    workspace: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ServerConfig {
        host: args.address,
        service_port: args.port,
        max_num_clients: args.max_clients,
        heart_beat_timeout_secs: args.heartbeat_timeout,
        secure_mode: args.secure_mode,
        ha_mode: args.ha_mode,
        workspace_root: args.workspace,
        ..Default::default()
    }
    .with_env_overrides();
    if let Some(project_name) = args.project_name {
        config.project_name = project_name;
    }
    config.validate()?;

    tracing::info!("Starting fleet coordinator");
    tracing::info!("  Project: {}", config.project_name);
    tracing::info!("  Address: {}:{}", config.host, config.service_port);
    tracing::info!("  Heartbeat timeout: {}s", config.heart_beat_timeout_secs);
    tracing::info!("  Secure mode: {}", config.secure_mode);
    tracing::info!("  HA mode: {}", config.ha_mode);

    // Without an external overseer this instance is always the primary,
    // under an ssid minted for the process lifetime.
    let overseer = Arc::new(StaticOverseer::new(
        format!("{}:{}", config.host, config.service_port),
        Uuid::new_v4().to_string(),
    ));
    let snapshots = Arc::new(FileSnapshotStore::new(
        config.workspace_root.join("fleet_snapshot.json"),
    ));

    let server = Arc::new(FederatedServer::new(
        config,
        Arc::new(InMemoryJobEngine::new()),
        overseer,
        snapshots,
        Arc::new(LoopbackTransport::new()),
    )?);

    // Start background loops: liveness sweep and overseer poll
    let handles = server.clone().start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down coordinator...");
    server.fl_shutdown().await;
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
