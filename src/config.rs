//! Configuration management for the blocklist-proxy application.
//!
//! Every section defaults to the proxy's fixed operating constants, so an
//! absent or empty YAML file behaves exactly like running with no
//! configuration at all.

use crate::error::{ProxyError, Result};
use crate::logging::level_directive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default listening endpoint.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Default size of the first read and of each relay chunk.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default blocklist file, relative to the working directory.
pub const DEFAULT_BLOCKLIST_PATH: &str = "blackList.txt";

/// Default seconds between blocklist reloads.
pub const DEFAULT_RELOAD_INTERVAL: u64 = 30;

/// Converts a seconds setting where 0 means "disabled".
fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port to listen on.
    pub listen: String,

    /// Bytes read from the client before sniffing, and per relay chunk.
    pub buffer_size: usize,

    /// Maximum concurrent sessions (0 = unbounded).
    pub max_connections: usize,

    /// Deadline for the client's first read, in seconds (0 = none).
    pub request_timeout: u64,

    /// Deadline for resolving and connecting to the origin, in seconds (0 = none).
    pub connect_timeout: u64,

    /// Relay read idle limit per direction, in seconds (0 = none).
    pub idle_timeout: u64,

    /// Seconds to wait for in-flight sessions on shutdown.
    pub shutdown_grace: u64,

    /// Use the port from the Host value instead of the fixed 443/80.
    pub honor_requested_port: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_connections: 0,
            request_timeout: 0,
            connect_timeout: 0,
            idle_timeout: 0,
            shutdown_grace: 5,
            honor_requested_port: false,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        optional_secs(self.request_timeout)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        optional_secs(self.connect_timeout)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        optional_secs(self.idle_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

/// Blocklist configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlocklistConfig {
    /// Line-oriented file of blocked host substrings.
    pub path: PathBuf,

    /// Seconds between wholesale reloads.
    pub reload_interval: u64,

    /// Also reload as soon as the file changes on disk.
    pub watch: bool,

    /// Match against the raw Host value including any `:port` suffix.
    pub match_port: bool,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_BLOCKLIST_PATH),
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            watch: false,
            match_port: true,
        }
    }
}

impl BlocklistConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include timestamps in logs.
    pub timestamps: bool,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
            include_target: true,
        }
    }
}

/// Static hostname override consulted before DNS.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostMapping {
    /// The hostname to match (exact, case-insensitive).
    pub hostname: String,

    /// The IP address to resolve to.
    pub ip: String,

    /// Optional port override.
    pub port: Option<u16>,
}

impl HostMapping {
    /// Validates the host mapping configuration.
    pub fn validate(&self) -> Result<()> {
        self.ip.parse::<IpAddr>().map_err(|_| {
            ProxyError::config_validation(format!("Invalid IP address: {}", self.ip))
        })?;

        if self.hostname.is_empty() {
            return Err(ProxyError::config_validation("Hostname cannot be empty"));
        }

        Ok(())
    }

    /// Returns the parsed IP address.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.parse().ok()
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,

    /// Blocklist source and matching.
    pub blocklist: BlocklistConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Hostname-to-IP overrides.
    pub host_mappings: Vec<HostMapping>,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let config = Self::from_yaml(&contents)?;
        config.validate()?;

        Ok(config)
    }

    /// Parses configuration from YAML text without validating it.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| ProxyError::config_parse(e.to_string()))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(ProxyError::config_validation(
                "Server listen address cannot be empty",
            ));
        }

        if self.server.buffer_size == 0 {
            return Err(ProxyError::config_validation(
                "Server buffer_size must be greater than zero",
            ));
        }

        if self.blocklist.path.as_os_str().is_empty() {
            return Err(ProxyError::config_validation(
                "Blocklist path cannot be empty",
            ));
        }

        if self.blocklist.reload_interval == 0 {
            return Err(ProxyError::config_validation(
                "Blocklist reload_interval must be greater than zero",
            ));
        }

        for mapping in &self.host_mappings {
            mapping.validate()?;
        }

        if level_directive(&self.logging.level).is_none() {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Builds a hostname lookup map for O(1) access.
    pub fn build_host_map(&self) -> HashMap<String, HostMapping> {
        self.host_mappings
            .iter()
            .map(|m| (m.hostname.to_lowercase(), m.clone()))
            .collect()
    }
}
