//! Sprinkler Node -- multicast file dissemination.
//!
//! Usage:
//!   sprinkler-node send FILE [--version N]       # Seed a file to the group
//!   sprinkler-node receive [--out DIR]           # Wait for a file, write it, exit
//!   sprinkler-node receive --keep-running        # Keep receiving and relaying
//!   sprinkler-node config                        # Print the effective config

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sprinkler_dissemination::{CompletedTransfer, SessionEvent};
use sprinkler_fountain::RaptorQCoder;
use sprinkler_node::config::NodeConfig;
use sprinkler_node::transport::UdpMulticastTransport;
use sprinkler_node::{expand_tilde, spawn_node, NodeHandle};
use sprinkler_protocol::Version;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "sprinkler-node", about = "Sprinkler multicast file dissemination node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.sprinkler/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed a file until interrupted
    Send {
        file: PathBuf,
        /// Transfer version; must be newer than anything on the group
        #[arg(long, default_value_t = 1)]
        version: Version,
        /// Print session status as JSON at this interval (seconds)
        #[arg(long)]
        status_every: Option<u64>,
    },
    /// Receive a file into the output directory
    Receive {
        /// Output directory (overrides node.output_dir)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Keep running (and relaying) after the first completed file
        #[arg(long)]
        keep_running: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sprinkler_node=info,sprinkler_dissemination=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Commands::Send {
            file,
            version,
            status_every,
        } => {
            let node = start_node(&cfg)?;
            run_send(&node, &file, version, status_every).await?;
            node.shutdown().await;
        }
        Commands::Receive { out, keep_running } => {
            let out_dir = out.unwrap_or_else(|| expand_tilde(&cfg.node.output_dir));
            let node = start_node(&cfg)?;
            run_receive(&node, &out_dir, keep_running).await?;
            node.shutdown().await;
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

fn start_node(cfg: &NodeConfig) -> anyhow::Result<NodeHandle> {
    tracing::info!(
        name = %cfg.node.name,
        version = env!("CARGO_PKG_VERSION"),
        group = %cfg.network.group,
        port = cfg.network.port,
        "starting sprinkler-node"
    );
    let transport = UdpMulticastTransport::join(&cfg.network)?;
    spawn_node(cfg, transport, Arc::new(RaptorQCoder::new()), rand::random())
}

async fn run_send(
    node: &NodeHandle,
    file: &Path,
    version: Version,
    status_every: Option<u64>,
) -> anyhow::Result<()> {
    let data = tokio::fs::read(file).await?;
    node.publish_bytes(version, &data).await?;
    tracing::info!(
        file = %file.display(),
        bytes = data.len(),
        version,
        "seeding, press Ctrl-C to stop"
    );

    let mut events = node.subscribe();
    let period = Duration::from_secs(status_every.unwrap_or(0).max(1));
    let mut status_tick = tokio::time::interval(period);
    status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = status_tick.tick(), if status_every.is_some() => {
                let status = node.status().await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Superseded { old, new }) if old == version => {
                    tracing::warn!(old, new, "a newer version appeared on the group, stopping");
                    return Ok(());
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event stream lagged, missed {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down...");
                return Ok(());
            }
        }
    }
}

async fn run_receive(node: &NodeHandle, out_dir: &Path, keep_running: bool) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(out_dir).await?;
    tracing::info!(out = %out_dir.display(), keep_running, "waiting for transfers");

    let mut events = node.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Completed(transfer)) => {
                    let path = write_transfer(out_dir, &node_prefix(node), &transfer).await?;
                    println!("{}", path.display());
                    if !keep_running {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event stream lagged, missed {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down...");
                return Ok(());
            }
        }
    }
}

fn node_prefix(node: &NodeHandle) -> String {
    node.name()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Write to a temporary name then rename, so readers never see a partial file.
async fn write_transfer(
    out_dir: &Path,
    prefix: &str,
    transfer: &CompletedTransfer,
) -> anyhow::Result<PathBuf> {
    let name = format!("{prefix}-v{}.bin", transfer.version);
    let path = out_dir.join(&name);
    let tmp = out_dir.join(format!(".{name}.partial"));
    tokio::fs::write(&tmp, transfer.file_bytes()).await?;
    tokio::fs::rename(&tmp, &path).await?;
    tracing::info!(
        path = %path.display(),
        version = transfer.version,
        bytes = transfer.content.file_len(),
        summary = %transfer.summary,
        at = %chrono::Utc::now().to_rfc3339(),
        "wrote received file"
    );
    Ok(path)
}
