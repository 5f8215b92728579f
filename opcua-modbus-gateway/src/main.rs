//! OPC UA server mirroring the holding registers of a Modbus TCP device.

use anyhow::{Context, Result};
use clap::Parser;
use opcua_modbus_gateway::config::GatewayConfig;
use opcua_modbus_gateway::gateway::run_until_signal;
use std::path::PathBuf;
use tracing::info;

/// Bidirectional Modbus TCP to OPC UA gateway.
#[derive(Parser, Debug)]
#[command(name = "opcua-modbus-gateway")]
#[command(about = "Exposes Modbus holding registers as OPC UA variables")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "gateway.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    opcua_modbus_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting opcua-modbus-gateway");
    info!("Loaded configuration from {:?}", args.config);

    run_until_signal(config, tokio::signal::ctrl_c()).await
}
