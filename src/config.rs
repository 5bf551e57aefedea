//! Configuration system for taskmesh
//!
//! Supports multiple configuration sources with the following precedence
//! (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (TASKMESH_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::discovery::{DiscoveryConfig, DEFAULT_BROADCAST_INTERVAL_SECS, DEFAULT_DISCOVERY_PORT};
use crate::error::{Error, Result};
use crate::peer::{ConnectionConfig, DEFAULT_PEER_PORT};
use crate::scheduler::SchedulerConfig;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and runtime settings
    pub node: NodeSettings,

    /// UDP discovery settings
    pub discovery: DiscoverySettings,

    /// TCP peer link settings
    pub network: NetworkSettings,

    /// Task scheduling settings
    pub scheduler: SchedulerSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Hostname override; the OS hostname is used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Worker threads for the async runtime (0 = auto)
    pub worker_threads: u32,
}

/// UDP discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// UDP port for presence broadcasts
    pub port: u16,

    /// Seconds between broadcasts
    pub broadcast_interval_secs: u64,
}

/// TCP peer link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// TCP port every node listens on for peer links
    pub peer_port: u16,

    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,

    /// Automatically dial discovered peers
    pub auto_connect: bool,

    /// Seconds between auto-connect passes
    pub auto_connect_interval_secs: u64,
}

/// Task scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds before an assigned task without a terminal status fails
    /// (0 disables the deadline)
    pub task_timeout_secs: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            discovery: DiscoverySettings::default(),
            network: NetworkSettings::default(),
            scheduler: SchedulerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            hostname: None,
            worker_threads: 0, // Auto-detect
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_interval_secs: DEFAULT_BROADCAST_INTERVAL_SECS,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            peer_port: DEFAULT_PEER_PORT,
            connect_timeout_ms: 10000,
            handshake_timeout_ms: 5000,
            auto_connect: true,
            auto_connect_interval_secs: 10,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            task_timeout_secs: 300,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If an explicit path is provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let expanded = shellexpand::tilde(path);
            let path = PathBuf::from(expanded.as_ref());
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("taskmesh.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("taskmesh").join("taskmesh.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".taskmesh.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/taskmesh/taskmesh.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TASKMESH_HOSTNAME") {
            self.node.hostname = Some(val);
        }
        if let Ok(val) = std::env::var("TASKMESH_WORKER_THREADS") {
            if let Ok(n) = val.parse() {
                self.node.worker_threads = n;
            }
        }

        if let Ok(val) = std::env::var("TASKMESH_DISCOVERY_PORT") {
            if let Ok(n) = val.parse() {
                self.discovery.port = n;
            }
        }
        if let Ok(val) = std::env::var("TASKMESH_BROADCAST_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                self.discovery.broadcast_interval_secs = n;
            }
        }

        if let Ok(val) = std::env::var("TASKMESH_PEER_PORT") {
            if let Ok(n) = val.parse() {
                self.network.peer_port = n;
            }
        }
        if let Ok(val) = std::env::var("TASKMESH_AUTO_CONNECT") {
            self.network.auto_connect = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("TASKMESH_TASK_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                self.scheduler.task_timeout_secs = n;
            }
        }

        if let Ok(val) = std::env::var("TASKMESH_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("TASKMESH_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("TASKMESH_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.discovery.port == 0 {
            return Err(Error::Config(
                "discovery.port must be between 1 and 65535".to_string(),
            ));
        }
        if self.network.peer_port == 0 {
            return Err(Error::Config(
                "network.peer_port must be between 1 and 65535".to_string(),
            ));
        }
        if self.discovery.port == self.network.peer_port {
            return Err(Error::Config(
                "discovery.port and network.peer_port must differ".to_string(),
            ));
        }
        if self.discovery.broadcast_interval_secs == 0 {
            return Err(Error::Config(
                "discovery.broadcast_interval_secs must be at least 1".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Discovery service configuration
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            port: self.discovery.port,
            broadcast_interval: Duration::from_secs(self.discovery.broadcast_interval_secs),
        }
    }

    /// Connection manager configuration
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            listen_port: self.network.peer_port,
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.network.handshake_timeout_ms),
        }
    }

    /// Scheduler configuration
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            task_timeout: Duration::from_secs(self.scheduler.task_timeout_secs),
        }
    }

    /// The hostname this node announces and handshakes under
    pub fn hostname(&self) -> String {
        if let Some(ref hostname) = self.node.hostname {
            return hostname.clone();
        }
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<()> {
    let config_path = path
        .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("taskmesh")
                .join("taskmesh.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    println!("Configuration file created: {}", config_path.display());
    Ok(())
}

/// Generate a commented default configuration file
fn generate_default_config() -> String {
    r#"# taskmesh node configuration

[node]
# Hostname override; the OS hostname is used when unset.
# hostname = "node-a"
# Worker threads for the async runtime (0 = auto)
worker_threads = 0

[discovery]
# UDP port for presence broadcasts
port = 50000
# Seconds between broadcasts
broadcast_interval_secs = 5

[network]
# TCP port every node listens on for peer links
peer_port = 50001
# Outbound connect timeout in milliseconds
connect_timeout_ms = 10000
# Handshake timeout in milliseconds
handshake_timeout_ms = 5000
# Automatically dial discovered peers
auto_connect = true
# Seconds between auto-connect passes
auto_connect_interval_secs = 10

[scheduler]
# Seconds before an assigned task without a terminal status fails (0 disables)
task_timeout_secs = 300

[logging]
# Log level: trace, debug, info, warn, error
level = "info"
# Log file path (unset = console only)
# file = "~/.taskmesh/taskmesh.log"
max_file_size_mb = 100
max_files = 5
json_format = false
"#
    .to_string()
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
