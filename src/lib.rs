//! # Blocklist Proxy Library
//!
//! A forwarding HTTP/HTTPS proxy that refuses hosts found in a
//! hot-reloaded substring blocklist and relays everything else verbatim.
//!
//! ## Modules
//!
//! - [`blocklist`]: Blocked-host snapshots, file loading and periodic reload
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup and configuration
//! - [`proxy`]: Accept loop and per-session dispatch
//! - [`relay`]: Bidirectional byte pumps
//! - [`resolver`]: Origin address resolution
//! - [`sniffer`]: Method and Host extraction from the first read
//!
//! ## Example
//!
//! ```ignore
//! use blocklist_proxy::{AppConfig, BlocklistLoader, BlocklistStore, ProxyServer};
//! use std::sync::Arc;
//!
//! let config = Arc::new(AppConfig::default());
//! let store = Arc::new(BlocklistStore::new());
//! let loader = BlocklistLoader::new(&config.blocklist.path, store.clone());
//! let _ = loader.reload().await;
//!
//! let server = ProxyServer::new(config, store);
//! server.run().await?;
//! ```
//!
//! ## Session Flow
//!
//! 1. **Sniff**: one read, look for `CONNECT` and the `Host: ` line
//! 2. **Check**: substring match against the current blocklist, 403 on a hit
//! 3. **Connect**: resolve (config mappings, then DNS) and connect
//! 4. **Relay**: pump bytes both ways until each side closes

pub mod blocklist;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod relay;
pub mod resolver;
pub mod sniffer;

pub use blocklist::{BlockedSet, BlocklistLoader, BlocklistStore};
pub use config::{AppConfig, HostMapping};
pub use error::{ProxyError, Result};
pub use proxy::{Decision, DispatchPolicy, ProxyServer, SessionOutcome};
pub use relay::{Relay, RelayStats};
pub use resolver::{HostResolver, Resolved};
pub use sniffer::InboundRequest;
