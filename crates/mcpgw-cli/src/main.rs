//! CLI entry point - the composition root.
//!
//! Loads configuration, bootstraps the gateway, and runs it until a
//! shutdown signal arrives.

mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use mcpgw_core::GatewaySettings;

/// MCP gateway: one HTTP front for stdio and HTTP backends.
#[derive(Debug, Parser)]
#[command(name = "mcpgw", version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen host from the config file.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port from the config file.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let (mut settings, descriptors) = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            warn!("No configuration file given; starting with defaults and no backends");
            (GatewaySettings::default(), Vec::new())
        }
    };
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }

    let state = mcpgw_axum::bootstrap(settings, descriptors).await?;
    mcpgw_axum::run(state, shutdown_signal()).await
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
