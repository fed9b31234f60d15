//! # Blocklist Proxy
//!
//! A forwarding HTTP/HTTPS proxy that denies hosts listed in a blocklist
//! file and tunnels or relays everything else.
//!
//! ## Features
//!
//! - **Substring Blocklist**: any Host containing a listed entry gets a 403
//! - **HTTPS Support**: opaque CONNECT tunnels, no TLS interception
//! - **Hot Reload**: the blocklist is re-read every interval, and on change
//!   when watching is enabled
//! - **Flexible Logging**: Configurable log levels and output destinations
//!
//! ## Usage
//!
//! ```bash
//! # Fixed defaults: port 8080, ./blackList.txt, reload every 30s
//! blocklist-proxy
//!
//! # Run with a config file
//! blocklist-proxy -c /path/to/proxy.yaml
//!
//! # Override listen address and blocklist file
//! blocklist-proxy -l 127.0.0.1:3128 -b /etc/blocked.txt
//!
//! # Increase verbosity
//! blocklist-proxy -vvvv  # trace level
//! ```

use blocklist_proxy::config::AppConfig;
use blocklist_proxy::logging;
use blocklist_proxy::{BlocklistLoader, BlocklistStore, ProxyServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A forwarding HTTP/HTTPS proxy with a hot-reloaded blocklist.
#[derive(Parser, Debug)]
#[command(name = "blocklist-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Blocklist file (overrides config)
    #[arg(short, long, env = "BLOCKLIST_PATH")]
    blocklist: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }
        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }
}

/// Application entry point.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = load_config(&args);
    if let Some(ref listen) = args.listen {
        config.server.listen = listen.clone();
    }
    if let Some(ref path) = args.blocklist {
        config.blocklist.path = path.clone();
    }
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen,
        blocklist = %config.blocklist.path.display(),
        reload_interval = config.blocklist.reload_interval,
        "Starting blocklist-proxy"
    );

    let config = Arc::new(config);
    let store = Arc::new(BlocklistStore::new());
    let server = ProxyServer::new(config.clone(), store.clone());
    let shutdown = server.shutdown_token();

    // Serve with whatever loads now; an unreadable file leaves the set empty
    let loader = BlocklistLoader::new(&config.blocklist.path, store);
    let _ = loader.reload().await;
    let _ = loader.spawn_periodic(config.blocklist.reload_interval(), shutdown.clone());

    if config.blocklist.watch {
        if let Err(e) = loader.spawn_watcher(shutdown.clone()) {
            error!(error = %e, "Failed to start blocklist watcher");
        }
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            shutdown.cancel();
        }
    });

    if let Err(e) = server.run().await {
        error!(error = %e, "Proxy server error");
        std::process::exit(1);
    }

    if !server.drain(config.server.shutdown_grace()).await {
        warn!(
            active = server.active_sessions(),
            "Sessions still running after shutdown grace period"
        );
    }
    info!("Stopped");
}

/// Load configuration from file or use defaults
fn load_config(args: &Args) -> AppConfig {
    let config_path = args.config.clone().or_else(|| {
        let defaults = [
            "./proxy.yaml",
            "./proxy.yml",
            "/etc/blocklist-proxy/config.yaml",
        ];
        defaults.into_iter().map(PathBuf::from).find(|p| p.exists())
    });

    let Some(path) = config_path else {
        return AppConfig::default();
    };

    match AppConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Failed to load config from {:?}: {}", path, e);
            eprintln!("Using default configuration");
            AppConfig::default()
        }
    }
}
