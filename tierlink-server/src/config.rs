//! Tier configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TIERLINK_CONFIG)
//! 3. Environment variables

use crate::server::MAX_IN_FLIGHT_PER_CONNECTION;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tierlink_protocol::{DEFAULT_CORE_PORT, DEFAULT_EDGE_PORT, DEFAULT_SWITCH_PORT};

/// Tier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Role of this process in the chain.
    pub tier: TierConfig,
    /// Inbound listener configuration.
    pub network: NetworkConfig,
    /// Outbound connection to the next tier.
    pub downstream: DownstreamConfig,
    /// Account data source (core tier only).
    pub store: StoreConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
    /// REST gateway (edge tier only).
    pub http: HttpConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TIERLINK_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Applies `TIERLINK_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides looked up through `var`. Unparseable values are
    /// ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(role) = var("TIERLINK_TIER").and_then(|v| v.parse().ok()) {
            self.tier.role = role;
        }
        if let Some(name) = var("TIERLINK_SERVICE_NAME") {
            self.tier.service_name = Some(name);
        }

        if let Some(addr) = var("TIERLINK_BIND").and_then(|v| v.parse().ok()) {
            self.network.bind_addr = Some(addr);
        }
        if let Some(n) = var("TIERLINK_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.network.max_connections = n;
        }
        if let Some(n) = var("TIERLINK_MAX_IN_FLIGHT").and_then(|v| v.parse().ok()) {
            self.network.max_in_flight_per_connection = n;
        }

        if let Some(addr) = var("TIERLINK_DOWNSTREAM") {
            self.downstream.addr = Some(addr);
        }
        if let Some(ms) = var("TIERLINK_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.downstream.connect_timeout_ms = ms;
        }
        if let Some(ms) = var("TIERLINK_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.downstream.request_timeout_ms = ms;
        }

        if let Some(path) = var("TIERLINK_ACCOUNTS_FILE") {
            self.store.accounts_file = Some(PathBuf::from(path));
        }

        if let Some(enabled) = var("TIERLINK_METRICS_ENABLED") {
            self.metrics.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Some(addr) = var("TIERLINK_METRICS_BIND").and_then(|v| v.parse().ok()) {
            self.metrics.bind_addr = addr;
        }

        if let Some(enabled) = var("TIERLINK_HTTP_ENABLED") {
            self.http.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Some(addr) = var("TIERLINK_HTTP_BIND").and_then(|v| v.parse().ok()) {
            self.http.bind_addr = addr;
        }
    }

    /// Checks the combination of settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tier.role.has_downstream() && self.downstream.addr().is_none() {
            return Err(ConfigError::Validation(format!(
                "{} tier requires downstream.addr",
                self.tier.role
            )));
        }
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "network.max_connections must be greater than 0".to_string(),
            ));
        }
        if !(1..=MAX_IN_FLIGHT_PER_CONNECTION).contains(&self.network.max_in_flight_per_connection)
        {
            return Err(ConfigError::Validation(format!(
                "network.max_in_flight_per_connection must be between 1 and {}",
                MAX_IN_FLIGHT_PER_CONNECTION
            )));
        }
        if self.http.enabled && self.tier.role != TierRole::Edge {
            return Err(ConfigError::Validation(format!(
                "http gateway is only available on the edge tier, not {}",
                self.tier.role
            )));
        }
        if self.downstream.connect_timeout_ms == 0 || self.downstream.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "downstream timeouts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the service name reported by `ping`.
    pub fn service_name(&self) -> String {
        self.tier
            .service_name
            .clone()
            .unwrap_or_else(|| self.tier.role.default_service_name().to_string())
    }

    /// Returns the listen address, falling back to the role's default port.
    pub fn bind_addr(&self) -> SocketAddr {
        self.network.bind_addr.unwrap_or_else(|| {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.tier.role.default_port()))
        })
    }
}

/// Process role in the edge -> switch -> core chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierRole {
    /// Entry tier; forwards to the switch.
    Edge,
    /// Middle tier; forwards to the core.
    Switch,
    /// Answers lookups from the account store.
    #[default]
    Core,
}

impl TierRole {
    pub fn default_port(&self) -> u16 {
        match self {
            TierRole::Edge => DEFAULT_EDGE_PORT,
            TierRole::Switch => DEFAULT_SWITCH_PORT,
            TierRole::Core => DEFAULT_CORE_PORT,
        }
    }

    pub fn default_service_name(&self) -> &'static str {
        match self {
            TierRole::Edge => "tierlink-edge",
            TierRole::Switch => "tierlink-switch",
            TierRole::Core => "tierlink-core",
        }
    }

    /// Whether this role relays lookups to a downstream tier.
    pub fn has_downstream(&self) -> bool {
        !matches!(self, TierRole::Core)
    }
}

impl fmt::Display for TierRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TierRole::Edge => "edge",
            TierRole::Switch => "switch",
            TierRole::Core => "core",
        })
    }
}

impl FromStr for TierRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "edge" | "gateway" => Ok(TierRole::Edge),
            "switch" | "switching" => Ok(TierRole::Switch),
            "core" => Ok(TierRole::Core),
            other => Err(ConfigError::Validation(format!("unknown tier: {}", other))),
        }
    }
}

/// Tier identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub role: TierRole,
    /// Name reported by `ping` (defaults per role).
    pub service_name: Option<String>,
}

/// Inbound listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to (defaults to the role's port on all interfaces).
    pub bind_addr: Option<SocketAddr>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum requests dispatched concurrently per connection.
    pub max_in_flight_per_connection: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            max_connections: 1000,
            max_in_flight_per_connection: 256,
        }
    }
}

/// Outbound connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// Next tier's address (`host:port`).
    pub addr: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            addr: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl DownstreamConfig {
    /// Returns the address if set and non-blank.
    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref().filter(|a| !a.trim().is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Account data source configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding an array of account lookups. Empty store if unset.
    pub accounts_file: Option<PathBuf>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

/// REST gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Enable the HTTP gateway.
    pub enabled: bool,
    /// Address to bind the gateway to.
    pub bind_addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
