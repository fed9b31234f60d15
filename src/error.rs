//! Error types for the blocklist-proxy application.
//!
//! Configuration and startup errors surface to `main`; everything that
//! happens inside a proxied session is logged and contained there.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the blocklist-proxy application.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// Blocklist source could not be read.
    #[error("Could not open blocked sites file {path}: {source}")]
    BlocklistUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Hostname did not resolve to any address.
    #[error("Failed to resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    /// Origin refused or dropped the connection attempt.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An opt-in deadline elapsed.
    #[error("Timed out during {operation}")]
    Timeout { operation: &'static str },

    /// File watcher could not be set up.
    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new resolution error.
    pub fn resolve(host: impl Into<String>, port: u16) -> Self {
        Self::Resolve {
            host: host.into(),
            port,
        }
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
