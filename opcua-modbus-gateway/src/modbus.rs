//! Modbus TCP side of the bridge: holding-register reads and writes.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_modbus::client::{Client, Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::config::ModbusClientConfig;

/// Error type for Modbus transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Write failed: {0}")]
    Write(String),
    #[error("Exception: {0}")]
    Exception(String),
}

/// Holding-register access to a remote Modbus device.
///
/// Callers issue one request at a time; implementations may assume a single
/// outstanding request.
#[async_trait]
pub trait RegisterClient: Send {
    /// Establish the connection ahead of the first request.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Read `count` holding registers starting at `address`.
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write consecutive holding registers starting at `address`.
    async fn write_registers(&mut self, address: u16, values: &[u16])
    -> Result<(), TransportError>;

    /// Release the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Modbus TCP client that reconnects lazily after any failure.
pub struct TcpRegisterClient {
    config: ModbusClientConfig,
    ctx: Option<Context>,
}

impl TcpRegisterClient {
    /// Create a client; no connection is made until the first request or [`connect`](RegisterClient::connect).
    pub fn new(config: ModbusClientConfig) -> Self {
        Self { config, ctx: None }
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Takes owned parts so the future does not borrow the client.
    async fn resolve(host: String, port: u16) -> Result<SocketAddr, TransportError> {
        tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| {
                TransportError::Connection(format!("Cannot resolve {}:{}: {}", host, port, e))
            })?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("No address for {}:{}", host, port)))
    }

    async fn context(&mut self) -> Result<&mut Context, TransportError> {
        if self.ctx.is_none() {
            let addr = Self::resolve(self.config.host.clone(), self.config.port).await?;
            let slave = Slave(self.config.unit_id);
            let ctx = tokio::time::timeout(self.timeout(), tcp::connect_slave(addr, slave))
                .await
                .map_err(|_| TransportError::Timeout(self.timeout()))?
                .map_err(|e| TransportError::Connection(e.to_string()))?;

            info!(%addr, unit_id = self.config.unit_id, "Connected to Modbus device");
            self.ctx = Some(ctx);
        }

        self.ctx
            .as_mut()
            .ok_or_else(|| TransportError::Connection("Not connected".to_string()))
    }

    /// Forget the connection so the next request reconnects.
    fn invalidate(&mut self, err: &TransportError) {
        if self.ctx.take().is_some() {
            warn!(error = %err, "Dropping Modbus connection");
        }
    }
}

#[async_trait]
impl RegisterClient for TcpRegisterClient {
    async fn connect(&mut self) -> Result<(), TransportError> {
        match self.context().await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.invalidate(&e);
                Err(e)
            }
        }
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let timeout = self.timeout();
        let result = async {
            let ctx = self.context().await?;
            tokio::time::timeout(timeout, ctx.read_holding_registers(address, count))
                .await
                .map_err(|_| TransportError::Timeout(timeout))?
                .map_err(|e| TransportError::Read(e.to_string()))?
                .map_err(|e| TransportError::Exception(format!("{:?}", e)))
        }
        .await;

        match result {
            Ok(words) if words.len() == usize::from(count) => {
                debug!(address, count, "Read holding registers");
                Ok(words)
            }
            Ok(words) => {
                let err = TransportError::Read(format!(
                    "Expected {} registers at {}, got {}",
                    count,
                    address,
                    words.len()
                ));
                self.invalidate(&err);
                Err(err)
            }
            // The device answered; the connection is still good
            Err(e @ TransportError::Exception(_)) => Err(e),
            Err(e) => {
                self.invalidate(&e);
                Err(e)
            }
        }
    }

    async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let timeout = self.timeout();
        let result = async {
            let ctx = self.context().await?;
            tokio::time::timeout(timeout, ctx.write_multiple_registers(address, values))
                .await
                .map_err(|_| TransportError::Timeout(timeout))?
                .map_err(|e| TransportError::Write(e.to_string()))?
                .map_err(|e| TransportError::Exception(format!("{:?}", e)))
        }
        .await;

        match result {
            Ok(()) => {
                debug!(address, count = values.len(), "Wrote holding registers");
                Ok(())
            }
            Err(e @ TransportError::Exception(_)) => Err(e),
            Err(e) => {
                self.invalidate(&e);
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut ctx) = self.ctx.take() {
            ctx.disconnect()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            info!("Disconnected from Modbus device");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: &str, port: u16) -> ModbusClientConfig {
        ModbusClientConfig {
            host: host.to_string(),
            port,
            unit_id: 1,
            timeout_ms: 200,
        }
    }

    #[test]
    fn test_new_client_is_lazy() {
        let client = TcpRegisterClient::new(config("127.0.0.1", 502));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop a listener to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut client = TcpRegisterClient::new(config("127.0.0.1", port));
        let err = client.read_holding_registers(0, 1).await.unwrap_err();

        assert!(matches!(
            err,
            TransportError::Connection(_) | TransportError::Timeout(_)
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_close_without_connection() {
        let mut client = TcpRegisterClient::new(config("127.0.0.1", 502));
        assert!(client.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_client_runs_on_a_spawned_task() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut client = TcpRegisterClient::new(config("localhost", port));
        let task = tokio::spawn(async move {
            let result = client.read_holding_registers(0, 1).await;
            (client, result)
        });

        let (client, result) = task.await.unwrap();
        assert!(result.is_err());
        assert!(!client.is_connected());
    }
}
