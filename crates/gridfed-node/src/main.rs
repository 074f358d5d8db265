//! gridfed-node - federated data-grid node
//!
//! Runs the peer membership, gossip and ingress control plane of one grid
//! node, and offers a few operator helpers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use gridfed_core::{PeerStateKind, PeerTransport};
use gridfed_node::{FederationNode, HttpPeerTransport, LogFormat, NodeConfig};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "gridfed_node=info,gridfed_core=info";

#[derive(Parser)]
#[command(name = "gridfed-node")]
#[command(about = "Federated data-grid node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Run {
        /// Path to config file
        #[arg(short, long, env = "GRIDFED_CONFIG", default_value = "/etc/gridfed/node.toml")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/gridfed/node.toml")]
        output: PathBuf,

        /// Node name
        #[arg(long, default_value = "gridfed-node")]
        name: String,

        /// Public service URL of this node
        #[arg(long, default_value = "http://localhost:8080/esg-node/datanode")]
        service_url: String,
    },

    /// Probe a peer's liveness endpoint
    Ping {
        /// Peer service URL
        #[arg(long)]
        url: String,

        /// Request timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },

    /// Fetch a peer's membership status
    Status {
        /// Peer service URL
        #[arg(long)]
        url: String,
    },
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(DEFAULT_LOG_FILTER),
    };
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_node(config).await?,
        Commands::InitConfig {
            output,
            name,
            service_url,
        } => {
            init_tracing(LogFormat::Text)?;
            init_config(output, name, service_url)?;
        }
        Commands::Ping { url, timeout_secs } => {
            init_tracing(LogFormat::Text)?;
            ping(&url, timeout_secs).await?;
        }
        Commands::Status { url } => {
            init_tracing(LogFormat::Text)?;
            status(&url).await?;
        }
    }

    Ok(())
}

async fn run_node(config_path: PathBuf) -> anyhow::Result<()> {
    let config = NodeConfig::from_file(&config_path)?;
    init_tracing(config.log_format)?;
    info!(config = %config_path.display(), "starting gridfed-node");
    info!(
        name = %config.name,
        service_url = %config.service_url,
        listen = %config.listen_addr,
        "loaded config"
    );

    let timeout = Duration::from_secs(config.federation.send_timeout_secs);
    let transport: Arc<dyn PeerTransport> = Arc::new(HttpPeerTransport::new(timeout)?);
    let node = FederationNode::new(config, transport)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => error!(error = %e, "failed to listen for interrupt"),
        }
        let _ = shutdown_tx.send(true);
    });

    node.run(shutdown_rx).await?;
    Ok(())
}

fn init_config(output: PathBuf, name: String, service_url: String) -> anyhow::Result<()> {
    let config = NodeConfig::new(name, service_url);
    config.validate()?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&output, config.to_toml()?)?;

    println!("Config written to: {}", output.display());
    Ok(())
}

async fn ping(url: &str, timeout_secs: u64) -> anyhow::Result<()> {
    let transport = HttpPeerTransport::new(Duration::from_secs(timeout_secs))?;
    match transport.probe_url(url).await {
        PeerStateKind::Available => println!("{url}: available"),
        PeerStateKind::Busy => println!("{url}: busy"),
        PeerStateKind::Failed => anyhow::bail!("{url}: unreachable"),
    }
    Ok(())
}

async fn status(url: &str) -> anyhow::Result<()> {
    let transport = HttpPeerTransport::new(Duration::from_secs(10))?;
    let status = transport.fetch_status(url).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
