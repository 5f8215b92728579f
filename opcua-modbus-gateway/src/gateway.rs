//! Gateway process wiring: server, address space, Modbus client and engine.

use anyhow::{Context, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::address_space::AddressSpace;
use crate::builder::build_address_space;
use crate::config::GatewayConfig;
use crate::engine::{EngineOptions, SyncEngine};
use crate::modbus::{RegisterClient, TcpRegisterClient};
use crate::opcua_server::{OpcuaServer, OpcuaServerError};

/// Run the gateway until `shutdown` is cancelled.
///
/// Configuration and build errors are returned before the server listens.
/// If the OPC UA server ends on its own, for example because its port is
/// taken, the gateway stops and returns the server's error.
pub async fn run_gateway(config: GatewayConfig, shutdown: CancellationToken) -> Result<()> {
    let mut server = OpcuaServer::build(&config.opcua_server, &shutdown)
        .context("Failed to build OPC UA server")?;
    let space = server.address_space();

    let registry = build_address_space(&config.nodes, &space, &space.root())
        .context("Failed to build address space")?;
    info!(tags = registry.len(), "Address space ready");

    server.start();

    let remote = &config.modbustcp_remote_server;
    let mut client = TcpRegisterClient::new(remote.clone());
    if let Err(e) = client.connect().await {
        warn!(
            host = %remote.host,
            port = remote.port,
            error = %e,
            "Modbus device unreachable, will retry every cycle"
        );
    }

    let options = EngineOptions {
        interval: config.polling_interval(),
        read_mode: config.read_mode,
    };
    let mut engine = SyncEngine::new(registry, client, space, options);
    let outcome = tokio::select! {
        _ = engine.run(shutdown.clone()) => Ok(()),
        result = server.wait() => match result {
            Ok(()) if shutdown.is_cancelled() => Ok(()),
            Ok(()) => Err(OpcuaServerError::Stopped("server exited".to_string())),
            Err(e) => Err(e),
        },
    };

    let mut client = engine.into_client();
    if let Err(e) = client.close().await {
        warn!(error = %e, "Failed to close Modbus connection");
    }

    if let Err(e) = outcome {
        error!(error = %e, "OPC UA server stopped unexpectedly");
        return Err(e.into());
    }
    server.stop().await;

    info!("Gateway stopped");
    Ok(())
}

/// Run the gateway until `signal` resolves, then shut it down.
///
/// A failure to listen for the signal is returned as an error, after the
/// gateway has been stopped.
pub async fn run_until_signal<F>(config: GatewayConfig, signal: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let shutdown = CancellationToken::new();
    let gateway = run_gateway(config, shutdown.clone());
    tokio::pin!(gateway);

    tokio::select! {
        result = &mut gateway => result,
        received = signal => {
            if received.is_ok() {
                info!("Received shutdown signal");
            }
            shutdown.cancel();
            gateway.await?;
            received.context("Failed to listen for shutdown signal")
        }
    }
}
