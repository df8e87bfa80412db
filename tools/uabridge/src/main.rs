//! uabridge
//!
//! Keeps one session to an industrial server, streams value changes of the
//! configured nodes to every WebSocket client and forwards client writes.
//!
//! Configuration comes from an optional TOML file overridden by
//! `UABRIDGE_*` environment variables.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uabridge_bridge::{Bridge, BridgeConfig};
use uabridge_core::Value;
use uabridge_protocol::{SimClient, SimServer, UaClient};

#[derive(Parser)]
#[command(name = "uabridge")]
#[command(about = "Bridge an industrial node server to WebSocket clients")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(short, long, env = "UABRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs)?;

    let config = BridgeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let client = protocol_client(&config)?;
    let bridge = Bridge::new(config, client).context("Failed to build bridge")?;

    tokio::select! {
        started = bridge.start() => started.context("Failed to start bridge")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted during startup");
            bridge.stop().await;
            return Ok(());
        }
    }

    let listen = bridge.config().listen.clone();
    let addr = match bridge.serve_websocket(&listen).await {
        Ok(addr) => addr,
        Err(e) => {
            bridge.stop().await;
            return Err(e).with_context(|| format!("Failed to listen on {}", listen));
        }
    };
    let status = bridge.status();
    info!(
        "Listening on ws://{} (session {}, generation {}, monitoring {:?})",
        addr, status.session_state, status.session_generation, status.monitored
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }
    info!("Shutting down");
    bridge.stop().await;
    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}

/// Protocol backend for the configured address
fn protocol_client(config: &BridgeConfig) -> Result<Arc<dyn UaClient>> {
    let address = config.server_address.as_str();
    if address.starts_with("sim://") {
        return Ok(sim_client(config));
    }
    if address.starts_with("opc.tcp://") {
        return opcua_client(config);
    }
    bail!(
        "Unsupported server address {}; expected opc.tcp:// or sim://",
        address
    )
}

fn sim_client(config: &BridgeConfig) -> Arc<dyn UaClient> {
    let server = SimServer::new(config.server_address.as_str());
    for node in &config.nodes {
        server.add_node(node.node_id.as_str(), Value::Null);
    }
    info!(
        "Using simulated server at {} with {} nodes",
        config.server_address,
        config.nodes.len()
    );
    Arc::new(SimClient::new(server))
}

#[cfg(feature = "opcua")]
fn opcua_client(config: &BridgeConfig) -> Result<Arc<dyn UaClient>> {
    let client = uabridge_protocol::OpcUaClient::new(&config.application, config.session_timeout())
        .context("Failed to build OPC UA client")?;
    info!("Using OPC UA client for {}", config.server_address);
    Ok(Arc::new(client))
}

#[cfg(not(feature = "opcua"))]
fn opcua_client(config: &BridgeConfig) -> Result<Arc<dyn UaClient>> {
    bail!(
        "{} needs the OPC UA client; rebuild with `--features opcua`",
        config.server_address
    )
}
