//! # Configuration Management
//!
//! Centralized configuration for an overlay node.
//!
//! This module provides structured configuration for the node's identity and
//! listening endpoint, the join handshake, the connection multiplexer and
//! logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`

use crate::error::{ProtocolError, Result};
use crate::protocol::message::{NodeId, INF, ROOT_LOW_BOUND};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Frame terminator appended after every encoded packet
pub const FRAME_TERMINATOR: &[u8; 2] = b"\r\n";

/// Max allowed frame size (e.g. 1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OverlayConfig {
    /// Node identity and endpoint
    #[serde(default)]
    pub node: NodeConfig,

    /// Join handshake configuration
    #[serde(default)]
    pub join: JoinConfig,

    /// Connection multiplexer configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OverlayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("BST_OVERLAY_LISTEN_PORT") {
            config.node.listen_port = port.parse::<u16>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid BST_OVERLAY_LISTEN_PORT: {e}"))
            })?;
        }

        if let Ok(host) = std::env::var("BST_OVERLAY_ADVERTISE_HOST") {
            config.node.advertise_host = host.parse::<IpAddr>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid BST_OVERLAY_ADVERTISE_HOST: {e}"))
            })?;
        }

        if let Ok(addr) = std::env::var("BST_OVERLAY_BOOTSTRAP") {
            config.node.bootstrap = Some(addr.parse::<SocketAddr>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid BST_OVERLAY_BOOTSTRAP: {e}"))
            })?);
        }

        if let Ok(username) = std::env::var("BST_OVERLAY_USERNAME") {
            config.node.username = Some(username);
        }

        if let Ok(timeout) = std::env::var("BST_OVERLAY_JOIN_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.join.response_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("BST_OVERLAY_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.join.connect_timeout = Duration::from_millis(val);
                config.transport.connect_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.node.validate());
        errors.extend(self.join.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Node identity and endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Port to listen on (0 picks an ephemeral port)
    pub listen_port: u16,

    /// Host other peers use to reach this node; the listener binds to it
    pub advertise_host: IpAddr,

    /// Peer to join through; absent means "start a fresh network as root"
    #[serde(default)]
    pub bootstrap: Option<SocketAddr>,

    /// Display name carried in membership announcements
    #[serde(default)]
    pub username: Option<String>,

    /// Fixed identifier instead of a randomly drawn one
    #[serde(default)]
    pub node_id: Option<NodeId>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 9090,
            advertise_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bootstrap: None,
            username: None,
            node_id: None,
        }
    }
}

impl NodeConfig {
    /// Address the listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.advertise_host, self.listen_port)
    }

    /// Validate node configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.advertise_host.is_unspecified() {
            errors.push(format!(
                "Advertise host cannot be unspecified: '{}' (peers could not reach it)",
                self.advertise_host
            ));
        }

        if let Some(bootstrap) = self.bootstrap {
            if bootstrap.port() == 0 {
                errors.push("Bootstrap port cannot be 0".to_string());
            }
            if self.listen_port != 0 && bootstrap == self.listen_addr() {
                errors.push("Bootstrap address cannot be this node's own address".to_string());
            }
        }

        if let Some(ref name) = self.username {
            if name.is_empty() {
                errors.push("Username cannot be empty when set".to_string());
            } else if name.len() > 64 {
                errors.push(format!(
                    "Username too long: {} characters (maximum: 64)",
                    name.len()
                ));
            }
        }

        if let Some(id) = self.node_id {
            if id <= ROOT_LOW_BOUND || id >= INF {
                errors.push(format!(
                    "Node id out of range: {id} (must lie strictly between {ROOT_LOW_BOUND} and {INF})"
                ));
            }
        }

        errors
    }
}

/// Join handshake configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinConfig {
    /// Timeout for one request/response step of the handshake
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    /// Timeout for dialing the bootstrap or the connecting host
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            response_timeout: timeout::JOIN_TIMEOUT,
            connect_timeout: timeout::CONNECT_TIMEOUT,
        }
    }
}

impl JoinConfig {
    /// Validate join configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.response_timeout.as_millis() < 10 {
            errors.push("Join response timeout too short (minimum: 10ms)".to_string());
        } else if self.response_timeout.as_secs() > 300 {
            errors.push("Join response timeout too long (maximum: 300s)".to_string());
        }

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Join connect timeout too short (minimum: 10ms)".to_string());
        } else if self.connect_timeout.as_secs() > 60 {
            errors.push("Join connect timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Connection multiplexer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Timeout for dialing a neighbor while routing
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Maximum encoded frame size in bytes (terminator excluded)
    pub max_frame_size: usize,

    /// Capacity of the connection event queue feeding the reactor
    pub event_capacity: usize,

    /// Capacity of the delivered chat message queue
    pub inbox_capacity: usize,

    /// Capacity of the command queue from node handles
    pub command_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: timeout::CONNECT_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            event_capacity: 1024,
            inbox_capacity: 256,
            command_capacity: 64,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        } else if self.connect_timeout.as_secs() > 60 {
            errors.push("Connect timeout too long (maximum: 60s)".to_string());
        }

        if self.max_frame_size == 0 {
            errors.push("Max frame size cannot be 0".to_string());
        } else if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        for (name, value) in [
            ("Event", self.event_capacity),
            ("Inbox", self.inbox_capacity),
            ("Command", self.command_capacity),
        ] {
            if value == 0 {
                errors.push(format!("{name} capacity must be greater than 0"));
            } else if value > 1_000_000 {
                errors.push(format!(
                    "{name} capacity too large: {value} (max recommended: 1,000,000)"
                ));
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("bst-overlay"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
