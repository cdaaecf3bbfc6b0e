//! edabridge daemon.
//!
//! Listens on the loopback port for the peer running inside the EDA host and
//! exposes its RPC surface to local tooling.
//!
//!   edabridge-daemon serve
//!   edabridge-daemon netlist --pretty
//!   edabridge-daemon parse board.net
//!   edabridge-daemon status

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edabridge_core::SnapshotWriter;
use edabridge_daemon::{DaemonConfig, ServerStatus, TransportServer, fetch_netlist};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "edabridge-daemon", version)]
#[command(about = "Loopback RPC bridge to an EDA host extension")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "EDABRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on, overriding the config file
    #[arg(short, long, global = true, env = "EDABRIDGE_PORT")]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server until interrupted
    Serve,
    /// Wait for the peer, fetch the schematic netlist and print it as JSON
    Netlist {
        /// Seconds to wait for a peer to attach
        #[arg(long, default_value_t = 60)]
        wait: u64,
        /// Emit the structured dialect instead of the parse result
        #[arg(long)]
        structured: bool,
        #[arg(long)]
        pretty: bool,
    },
    /// Parse a netlist file offline
    Parse {
        file: PathBuf,
        #[arg(long)]
        pretty: bool,
    },
    /// Print the status persisted by a running daemon
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("edabridge=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Netlist {
            wait,
            structured,
            pretty,
        } => netlist(config, Duration::from_secs(wait), structured, pretty).await,
        Command::Parse { file, pretty } => parse(file, pretty),
        Command::Status => status(&config),
    }
}

async fn start(config: &DaemonConfig) -> Result<TransportServer> {
    let mut builder = TransportServer::builder(config.server.clone());
    if let Some(path) = &config.status_file {
        builder = builder.snapshots(SnapshotWriter::spawn(path.clone()));
    }
    let server = builder
        .bind()
        .await
        .context("cannot start edabridge server")?;
    Ok(server)
}

async fn serve(config: DaemonConfig) -> Result<()> {
    let server = start(&config).await?;
    tracing::info!("Waiting for a peer on {}", server.url());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.shutdown().await;
    Ok(())
}

async fn netlist(config: DaemonConfig, wait: Duration, structured: bool, pretty: bool) -> Result<()> {
    let server = start(&config).await?;
    if !server.wait_for_peer(wait).await {
        anyhow::bail!("no peer attached within {}s", wait.as_secs());
    }

    let parsed = fetch_netlist(&server, None)
        .await
        .context("fetching netlist from peer")?;
    let output = if structured {
        parsed.graph.to_structured_json()
    } else {
        serde_json::to_value(&parsed)?
    };
    print_json(&output, pretty)?;
    server.shutdown().await;
    Ok(())
}

fn parse(file: PathBuf, pretty: bool) -> Result<()> {
    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let parsed = edabridge_netlist::parse_any(&text);
    for warning in &parsed.warnings {
        tracing::warn!("{}: {}", file.display(), warning);
    }
    print_json(&serde_json::to_value(&parsed)?, pretty)
}

fn status(config: &DaemonConfig) -> Result<()> {
    let path = config
        .status_file
        .as_deref()
        .context("no status_file configured")?;
    let status = ServerStatus::read_from(path)?;
    print_json(&serde_json::to_value(&status)?, true)
}

fn print_json(value: &serde_json::Value, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}
