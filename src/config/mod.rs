//! Configuration management

use crate::tunnel::{OpenFailurePolicy, DEFAULT_POLL_INTERVAL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Simulation file read by the memory backend, relative to the home directory
pub const SIMULATION_FILE: &str = "simulation.toml";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gateway backend selection
    pub gateway: GatewayConfig,
    /// Session credentials
    pub session: SessionConfig,
    /// Tunnel behavior
    pub tunnel: TunnelConfig,
    /// RPC interface settings
    pub rpc: RpcConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Load configuration from file, falling back to defaults if it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, crate::Error> {
        let config: Self = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.tunnel.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "tunnel.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Gateway backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayBackend {
    /// Plain TCP forwarding to devices on the local network
    #[default]
    Direct,
    /// In-memory backend seeded from the simulation file
    Memory,
}

impl FromStr for GatewayBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(GatewayBackend::Direct),
            "memory" => Ok(GatewayBackend::Memory),
            other => Err(format!("unknown gateway backend '{}' (direct, memory)", other)),
        }
    }
}

impl fmt::Display for GatewayBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayBackend::Direct => write!(f, "direct"),
            GatewayBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Backend carrying sessions, tunnels and RPC
    pub backend: GatewayBackend,
    /// Directory holding the backend's state (certificates, simulation file)
    pub home_dir: Option<String>,
    /// Address tunnel listeners bind to (direct backend)
    pub bind_host: String,
}

impl GatewayConfig {
    /// Home directory, the working directory when unset
    pub fn home_dir(&self) -> PathBuf {
        self.home_dir
            .as_deref()
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
    }

    /// Path of the memory backend's simulation file
    pub fn simulation_file(&self) -> PathBuf {
        self.home_dir().join(SIMULATION_FILE)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: GatewayBackend::Direct,
            home_dir: None,
            bind_host: "127.0.0.1".to_string(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the credential used to open the session
    pub cert_name: Option<String>,
    /// Passphrase unlocking the credential's private key
    pub password: String,
    /// JSON document passed to the basestation for authentication
    pub basestation_auth_json: Option<String>,
    /// Pre-shared key id for local connections (hex)
    pub psk_id: Option<String>,
    /// Pre-shared key for local connections (hex)
    pub psk: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cert_name: None,
            password: "not-so-secret".to_string(),
            basestation_auth_json: None,
            psk_id: None,
            psk: None,
        }
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Interval between state polls in milliseconds
    pub poll_interval_ms: u64,
    /// Remote host used when only a remote port is given
    pub default_remote_host: String,
    /// What happens to opened tunnels when a later one fails to open
    pub on_open_failure: OpenFailurePolicy,
}

impl TunnelConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            default_remote_host: "127.0.0.1".to_string(),
            on_open_failure: OpenFailurePolicy::Rollback,
        }
    }
}

/// RPC configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Interface definition file installed before invoking
    pub interface_definition: Option<String>,
    /// Interface id the caller expects from the peer
    pub interface_id: Option<String>,
    /// Interface version the caller expects (`<major>.<minor>`)
    pub interface_version: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// State of the memory backend: what it discovers, who may log in and what
/// RPC URLs answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Device ids reported by discovery; tunnels to them connect locally
    pub devices: Vec<String>,
    /// Stored certificates
    pub certificates: Vec<CertificateEntry>,
    /// RPC URL to response document
    pub responses: BTreeMap<String, String>,
    /// RPC URL to error document
    pub failures: BTreeMap<String, String>,
}

/// A certificate stored by the memory backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateEntry {
    pub name: String,
    pub password: String,
    /// Colon separated hex, generated when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl SimulationConfig {
    /// Load a simulation file, empty if it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read simulation: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse simulation: {}", e)))
    }

    /// Serialize to TOML text
    pub fn to_toml(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize simulation: {}", e)))
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        gateway: GatewayConfig::default(),
        session: SessionConfig {
            cert_name: Some("guest".to_string()),
            ..SessionConfig::default()
        },
        tunnel: TunnelConfig::default(),
        rpc: RpcConfig {
            interface_definition: Some("unabto_queries.xml".to_string()),
            interface_id: None,
            interface_version: None,
        },
        logging: LoggingConfig::default(),
    }
}
