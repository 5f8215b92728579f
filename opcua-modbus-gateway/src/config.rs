//! Configuration for the OPC UA / Modbus gateway.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use opcua_modbus_common::LoggingConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Variable node {node}: missing required field '{field}'")]
    MissingField { node: String, field: &'static str },
    #[error("Variable '{name}': unknown type '{value}' (use float, int, byte, word or boolean)")]
    UnknownType { name: String, value: String },
    #[error("Variable '{name}': unknown modbus_type '{value}'")]
    UnknownModbusType { name: String, value: String },
    #[error("Variable '{name}': modbus_type '{value}' is not supported (only holding_register)")]
    UnsupportedModbusType { name: String, value: String },
    #[error("Variable '{name}': {reason}")]
    InvalidSelector { name: String, reason: String },
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Embedded OPC UA server settings
    pub opcua_server: OpcuaServerConfig,

    /// Remote Modbus TCP device
    pub modbustcp_remote_server: ModbusClientConfig,

    /// Delay between two poll cycles, in seconds
    #[serde(default = "default_polling_cycle")]
    pub polling_cycle_seconds: f64,

    /// How registers are acquired each cycle
    #[serde(default)]
    pub read_mode: ReadMode,

    /// Address-space node tree
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_polling_cycle() -> f64 {
    1.0
}

/// Embedded OPC UA server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcuaServerConfig {
    /// Bind address
    #[serde(default = "default_opcua_host", alias = "ip")]
    pub host: String,

    /// TCP port (default: 4840)
    #[serde(default = "default_opcua_port")]
    pub port: u16,

    /// Endpoint path (default: "/")
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,

    /// Namespace URI the gateway nodes are registered under
    #[serde(default = "default_namespace_uri")]
    pub namespace_uri: String,

    #[serde(default = "default_application_name")]
    pub application_name: String,

    #[serde(default = "default_application_uri")]
    pub application_uri: String,

    /// PKI directory for the server's own certificate
    #[serde(default = "default_pki_dir")]
    pub pki_dir: String,
}

fn default_opcua_host() -> String {
    "0.0.0.0".to_string()
}

fn default_opcua_port() -> u16 {
    4840
}

fn default_endpoint_path() -> String {
    "/".to_string()
}

fn default_namespace_uri() -> String {
    "http://examples.modbustcp".to_string()
}

fn default_application_name() -> String {
    "OPC UA Modbus Gateway".to_string()
}

fn default_application_uri() -> String {
    "urn:opcua-modbus-gateway".to_string()
}

fn default_pki_dir() -> String {
    "pki".to_string()
}

impl Default for OpcuaServerConfig {
    fn default() -> Self {
        Self {
            host: default_opcua_host(),
            port: default_opcua_port(),
            endpoint_path: default_endpoint_path(),
            namespace_uri: default_namespace_uri(),
            application_name: default_application_name(),
            application_uri: default_application_uri(),
            pki_dir: default_pki_dir(),
        }
    }
}

/// Remote Modbus TCP device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusClientConfig {
    /// Host address (IP or hostname)
    #[serde(alias = "ip")]
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Connect and request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

impl ModbusClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Register acquisition strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// One read covering the whole poll window (default)
    #[default]
    Batched,
    /// One single-register read per tag
    PerTag,
}

/// One entry of the address-space node tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeConfig {
    /// Container node with children
    ObjectNode(ObjectConfig),
    /// Variable mapped onto a register
    VariableNode(VariableConfig),
}

/// Container node declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Variable node declaration.
///
/// Required fields are optional here so the builder can report which one is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableConfig {
    pub name: Option<String>,

    /// One of float, int, byte, word, boolean
    #[serde(rename = "type")]
    pub r#type: Option<String>,

    pub modbus_address: Option<u16>,

    /// Register table (default: holding_register)
    pub modbus_type: Option<String>,

    /// Bit index for booleans (0-15). For bytes, 0 selects the low byte and
    /// any other value the high byte.
    pub modbus_bit: Option<u8>,

    /// Allow OPC UA clients to write this variable back to the device
    #[serde(default)]
    pub opc_writable: bool,
}

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Node declarations are validated by the address-space builder.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.polling_cycle_seconds.is_finite() || self.polling_cycle_seconds <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "polling_cycle_seconds must be a positive number, got {}",
                self.polling_cycle_seconds
            )));
        }

        if self.opcua_server.port == 0 {
            return Err(ConfigError::Validation(
                "opcua_server.port must be in range 1..=65535".to_string(),
            ));
        }

        if self.opcua_server.host.is_empty() {
            return Err(ConfigError::Validation(
                "opcua_server.host cannot be empty".to_string(),
            ));
        }

        if self.modbustcp_remote_server.host.is_empty() {
            return Err(ConfigError::Validation(
                "modbustcp_remote_server.host cannot be empty".to_string(),
            ));
        }

        if self.modbustcp_remote_server.port == 0 {
            return Err(ConfigError::Validation(
                "modbustcp_remote_server.port must be in range 1..=65535".to_string(),
            ));
        }

        if self.modbustcp_remote_server.unit_id == 0 {
            return Err(ConfigError::Validation(
                "modbustcp_remote_server.unit_id must be 1-247".to_string(),
            ));
        }

        if self.nodes.is_empty() {
            return Err(ConfigError::Validation(
                "At least one node must be configured".to_string(),
            ));
        }

        Ok(())
    }

    /// Polling interval as a duration.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs_f64(self.polling_cycle_seconds)
    }
}
