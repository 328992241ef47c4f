//! Configuration module
//!
//! Handles loading, validating and saving LoRaHop configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{EngineConfig, ModemConfig};
use crate::protocol::{Address, DEFAULT_TTL};
use crate::routing::CacheWindows;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Identity of this node and the network around it
    #[serde(default)]
    pub node: NodeConfig,

    /// Protocol timing and retry settings
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Radio modem connection
    #[serde(default)]
    pub modem: ModemSettings,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this node
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address assigned to the local radio module
    pub address: Option<String>,
    /// Every address that may exist in the network
    #[serde(default = "default_known_nodes")]
    pub known_nodes: Vec<String>,
}

fn default_known_nodes() -> Vec<String> {
    (100..=299).map(|n| format!("{:04}", n)).collect()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: None,
            known_nodes: default_known_nodes(),
        }
    }
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_ttl")]
    pub default_ttl: u8,
    /// Transmissions per message, route request or registration
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_route_discovery_timeout")]
    pub route_discovery_timeout_ms: u64,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_ms: u64,
    /// Window of the route request and registration caches
    #[serde(default = "default_dedup_window")]
    pub dedup_window_ms: u64,
    /// Window of the connect and disconnect request caches
    #[serde(default = "default_session_dedup_window")]
    pub session_dedup_window_ms: u64,
    /// Window of the delivered message cache
    #[serde(default = "default_message_dedup_window")]
    pub message_dedup_window_ms: u64,
    /// Upper bound of the random delay before each transmission
    #[serde(default = "default_max_jitter")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

fn default_max_attempts() -> u32 {
    3
}

fn default_ack_timeout() -> u64 {
    5000
}

fn default_route_discovery_timeout() -> u64 {
    5000
}

fn default_registration_timeout() -> u64 {
    2500
}

fn default_dedup_window() -> u64 {
    8000
}

fn default_session_dedup_window() -> u64 {
    45_000
}

fn default_message_dedup_window() -> u64 {
    300_000
}

fn default_max_jitter() -> u64 {
    1000
}

fn default_event_queue() -> usize {
    256
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
            max_attempts: default_max_attempts(),
            ack_timeout_ms: default_ack_timeout(),
            route_discovery_timeout_ms: default_route_discovery_timeout(),
            registration_timeout_ms: default_registration_timeout(),
            dedup_window_ms: default_dedup_window(),
            session_dedup_window_ms: default_session_dedup_window(),
            message_dedup_window_ms: default_message_dedup_window(),
            max_jitter_ms: default_max_jitter(),
            event_queue: default_event_queue(),
        }
    }
}

/// Modem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemSettings {
    /// Serial device node of the modem (e.g. /dev/ttyS0)
    pub device: Option<PathBuf>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// host:port of a serial-over-TCP bridge, used instead of `device`
    pub tcp: Option<String>,
    #[serde(default = "default_verification_timeout")]
    pub verification_timeout_ms: u64,
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_verification_timeout() -> u64 {
    25_000
}

fn default_inbound_queue() -> usize {
    1000
}

fn default_command_queue() -> usize {
    100
}

fn default_max_line_length() -> usize {
    512
}

impl Default for ModemSettings {
    fn default() -> Self {
        Self {
            device: None,
            baud_rate: default_baud_rate(),
            tcp: None,
            verification_timeout_ms: default_verification_timeout(),
            inbound_queue: default_inbound_queue(),
            command_queue: default_command_queue(),
            max_line_length: default_max_line_length(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("lorahop/config.toml")),
            Some(PathBuf::from("./lorahop.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Local node address, required to run
    pub fn address(&self) -> ConfigResult<Address> {
        let address = self
            .node
            .address
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("node.address is not set".to_string()))?;
        parse_address(address)
    }

    pub fn known_nodes(&self) -> ConfigResult<Vec<Address>> {
        self.node
            .known_nodes
            .iter()
            .map(|node| parse_address(node))
            .collect()
    }

    /// Check values the protocol cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(address) = &self.node.address {
            parse_address(address)?;
        }
        self.known_nodes()?;

        let protocol = &self.protocol;
        if protocol.default_ttl < 2 {
            return Err(ConfigError::Invalid(
                "protocol.default_ttl must be at least 2".to_string(),
            ));
        }
        if protocol.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "protocol.max_attempts must not be zero".to_string(),
            ));
        }
        if protocol.event_queue == 0 || self.modem.inbound_queue == 0 || self.modem.command_queue == 0
        {
            return Err(ConfigError::Invalid("queue sizes must not be zero".to_string()));
        }
        if self.modem.baud_rate == 0 {
            return Err(ConfigError::Invalid("modem.baud_rate must not be zero".to_string()));
        }
        if self.modem.device.is_some() && self.modem.tcp.is_some() {
            return Err(ConfigError::Invalid(
                "modem.device and modem.tcp are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Engine settings for this node
    pub fn engine_config(&self) -> ConfigResult<EngineConfig> {
        let protocol = &self.protocol;
        let mut config = EngineConfig::new(self.address()?, self.known_nodes()?);

        config.default_ttl = protocol.default_ttl;
        config.max_attempts = protocol.max_attempts;
        config.ack_timeout = Duration::from_millis(protocol.ack_timeout_ms);
        config.route_discovery_timeout = Duration::from_millis(protocol.route_discovery_timeout_ms);
        config.registration_timeout = Duration::from_millis(protocol.registration_timeout_ms);
        config.cache_windows = CacheWindows {
            route_request: Duration::from_millis(protocol.dedup_window_ms),
            registration: Duration::from_millis(protocol.dedup_window_ms),
            session: Duration::from_millis(protocol.session_dedup_window_ms),
            message: Duration::from_millis(protocol.message_dedup_window_ms),
        };
        config.max_jitter = Duration::from_millis(protocol.max_jitter_ms);
        config.event_queue = protocol.event_queue;

        Ok(config)
    }

    pub fn modem_config(&self) -> ModemConfig {
        ModemConfig {
            verification_timeout: Duration::from_millis(self.modem.verification_timeout_ms),
            inbound_queue: self.modem.inbound_queue,
            command_queue: self.modem.command_queue,
            max_line_length: self.modem.max_line_length,
        }
    }
}

fn parse_address(value: &str) -> ConfigResult<Address> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}", e)))
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "rooftop-relay".to_string(),
            verbose: false,
        },
        node: NodeConfig {
            address: Some("0131".to_string()),
            ..Default::default()
        },
        modem: ModemSettings {
            device: Some(PathBuf::from("/dev/ttyS0")),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
