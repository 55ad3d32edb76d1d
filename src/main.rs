//! Fanout Hub Server
//!
//! WebSocket broadcast hub. Relays every message a peer sends to all
//! connected peers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fanout_hub::config::{HubConfig, CONFIG_FILE};
use fanout_hub::server::WebSocketServer;

/// Fanout Hub
///
/// WebSocket broadcast hub
#[derive(Parser, Debug)]
#[command(name = "fanout-hub")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Upgrade path (overrides the config file)
    #[arg(long)]
    path: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Load the config file and apply command line overrides
    fn into_config(self) -> anyhow::Result<HubConfig> {
        let mut config = HubConfig::load(&self.config)?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(path) = self.path {
            config.path = path;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Fanout Hub v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config()?;
    if !config.allowed_origins.is_empty() {
        info!("Accepting origins: {}", config.allowed_origins.join(", "));
    }

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
