//! Destination resolution for the proxy.
//!
//! Hostnames are resolved in this order:
//! 1. Config mappings (exact, case-insensitive match)
//! 2. DNS resolution, preferring IPv4 addresses

use crate::config::{AppConfig, HostMapping};
use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, trace};

/// Where a resolved address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    /// A `host_mappings` entry.
    Mapping,
    /// The system resolver.
    Dns,
}

/// A connectable origin address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub addr: SocketAddr,
    pub source: ResolveSource,
}

/// Host resolver with static overrides.
#[derive(Debug, Clone, Default)]
pub struct HostResolver {
    /// Lowercased hostname to mapping.
    host_map: HashMap<String, HostMapping>,
}

impl HostResolver {
    /// Creates a resolver from the configuration's host mappings.
    pub fn new(config: &AppConfig) -> Self {
        Self {
            host_map: config.build_host_map(),
        }
    }

    /// Resolves `hostname` for a connection to `port`.
    ///
    /// A mapping with its own port overrides `port`. The hostname is looked up
    /// verbatim, so a value still carrying a `:port` suffix only resolves if a
    /// mapping names it exactly.
    pub async fn resolve(&self, hostname: &str, port: u16) -> Result<Resolved> {
        if let Some(resolved) = self.lookup_mapping(hostname, port) {
            return Ok(resolved);
        }

        // IPv6 literals arrive bracketed from the Host header
        let bare = hostname
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(hostname);

        if let Ok(ip) = bare.parse::<IpAddr>() {
            trace!(ip = %ip, port, "Host is an IP literal");
            return Ok(Resolved {
                addr: SocketAddr::new(ip, port),
                source: ResolveSource::Dns,
            });
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((bare, port))
            .await
            .map_err(|e| {
                debug!(hostname = %hostname, error = %e, "DNS lookup failed");
                ProxyError::resolve(hostname, port)
            })?
            .collect();

        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ProxyError::resolve(hostname, port))?;

        debug!(hostname = %hostname, addr = %addr, "Resolved via DNS");
        Ok(Resolved {
            addr,
            source: ResolveSource::Dns,
        })
    }

    fn lookup_mapping(&self, hostname: &str, port: u16) -> Option<Resolved> {
        let mapping = self.host_map.get(&hostname.to_lowercase())?;
        let ip = mapping.ip_addr()?;
        let port = mapping.port.unwrap_or(port);
        debug!(hostname = %hostname, ip = %ip, port, "Resolved via config mapping");
        Some(Resolved {
            addr: SocketAddr::new(ip, port),
            source: ResolveSource::Mapping,
        })
    }
}
