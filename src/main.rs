//! # Endpoint Gateway - Main Entry Point
//!
//! Loads the gateway configuration and the configuration store seed, then
//! serves proxied requests until SIGINT/SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use endpoint_gateway::core::error::GatewayError;
use endpoint_gateway::observability::{logging, metrics};
use endpoint_gateway::{GatewayConfig, GatewayResult, GatewayServer, MemoryStore, ProxyServices, Store};

#[derive(Parser, Debug)]
#[command(name = "endpoint-gateway", version, about = "Scriptable API gateway")]
struct Cli {
    /// Gateway configuration file (YAML or JSON)
    #[arg(short, long, env = "GATEWAY_CONFIG_PATH", default_value = "config/gateway.yaml")]
    config: PathBuf,

    /// Developer mode: echo error detail to clients
    #[arg(long)]
    dev: bool,

    /// Load and validate the configuration and store seed, then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("Gateway failed: {}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> GatewayResult<()> {
    let mut config = GatewayConfig::load_from_file(&cli.config).await?;
    if cli.dev {
        config.proxy.dev_mode = true;
    }

    logging::init(&config.observability.logging);
    info!("Starting endpoint gateway {}", env!("CARGO_PKG_VERSION"));

    let store = load_store(&config).await?;
    if cli.validate {
        let endpoints = store.endpoints().await?;
        info!(endpoints = endpoints.len(), "Configuration is valid");
        return Ok(());
    }

    if let Some(port) = config.observability.metrics_port {
        metrics::install_exporter(port)?;
    }

    let services = ProxyServices::new(config, store).await?;
    let server = GatewayServer::new(services)?;
    server.start(shutdown_signal()).await
}

async fn load_store(config: &GatewayConfig) -> GatewayResult<Arc<dyn Store>> {
    let capacity = config.store.change_feed_capacity;
    let store = match &config.store.seed {
        Some(path) => MemoryStore::load_seed_file(path, capacity).await?,
        None => {
            info!("No store seed configured, starting with an empty store");
            MemoryStore::with_feed_capacity(capacity)
        }
    };
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %GatewayError::from(e), "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
