use anyhow::{Context, Result};
use clap::Parser;
use neoconf::NeoConfig;
use neohub::{DiscoveryServer, Hub};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// The Neofabric hub
///
/// Routes requests between service workers and callers over the fabric
/// protocol, and serves the discovery endpoint.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/neofabric/config.toml
/// 3. ~/.config/neofabric/config.toml
/// 4. ./neofabric.toml (or --config path)
/// 5. Environment variables (NEO_IPC_HOST, NEO_IPC_PORT, DISCOVERY_PORT, ...)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./neofabric.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = NeoConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {}", var);
            }
        }
        println!();
        println!("{}", config.to_toml());
        return Ok(());
    }

    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("invalid configuration: {}", problems.join("; "));
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.hub.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("configuration loaded from:");
    for path in &sources.files {
        info!("   - {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        info!("   environment overrides: {:?}", sources.env_overrides);
    }

    let (shutdown_tx, _) = broadcast::channel(1);

    let hub = Hub::new(config.clone());
    let discovery = DiscoveryServer::new(hub.registry());

    let disco_host = config.hub.host.clone();
    let disco_port = config.hub.discovery_port;
    let disco_shutdown = shutdown_tx.subscribe();
    let discovery_task = tokio::spawn(async move {
        discovery
            .serve(&disco_host, disco_port, disco_shutdown)
            .await
    });

    let hub_shutdown = shutdown_tx.subscribe();
    let hub_task = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.serve(hub_shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(());

    hub_task.await??;
    discovery_task.await??;
    Ok(())
}
