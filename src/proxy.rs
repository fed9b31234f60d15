//! Proxy acceptor and per-session dispatch.
//!
//! Every accepted connection gets its own task that walks the session
//! through a fixed sequence:
//! - read once and sniff the method and Host value
//! - check the Host against the current blocklist generation
//! - answer 403, or connect to the origin and hand both streams to the relay
//!
//! Sessions are spawned on a [`TaskTracker`] so shutdown can wait for them,
//! but the accept loop never waits on a session.

use crate::blocklist::{BlockedSet, BlocklistStore};
use crate::config::AppConfig;
use crate::error::{ProxyError, Result};
use crate::relay::{Relay, RelayStats};
use crate::resolver::HostResolver;
use crate::sniffer::InboundRequest;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Port a CONNECT tunnel targets unless the requested port is honored.
pub const HTTPS_PORT: u16 = 443;

/// Port a plain request targets unless the requested port is honored.
pub const HTTP_PORT: u16 = 80;

/// Sent to the client once the origin accepted a tunnel connection.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Builds the response sent for a blocked host.
pub fn forbidden_response(host: &str) -> String {
    format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: text/html\r\n\r\n\
         <html><body><h1>403 Forbidden</h1>\
         <p>Access to {host} is blocked by the proxy server.</p>\
         </body></html>"
    )
}

/// How a sniffed request is turned into a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Use the Host value's port instead of 443/80.
    pub honor_requested_port: bool,
    /// Match the blocklist against the Host value including its port.
    pub match_port: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            honor_requested_port: false,
            match_port: true,
        }
    }
}

impl DispatchPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            honor_requested_port: config.server.honor_requested_port,
            match_port: config.blocklist.match_port,
        }
    }
}

/// Where a sniffed request goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The Host matched the blocklist.
    Blocked,
    /// Opaque tunnel for a CONNECT request.
    Tunnel { hostname: String, port: u16 },
    /// Forward the received bytes and relay the rest.
    Relay { hostname: String, port: u16 },
}

/// Decides what to do with a request. Does no I/O.
pub fn decide(request: &InboundRequest, blocked: &BlockedSet, policy: DispatchPolicy) -> Decision {
    let match_target = if policy.match_port {
        request.host()
    } else {
        request.hostname()
    };
    if blocked.matches(match_target) {
        return Decision::Blocked;
    }

    let requested = |default: u16| {
        if policy.honor_requested_port {
            request.requested_port().unwrap_or(default)
        } else {
            default
        }
    };

    if request.is_connect() {
        Decision::Tunnel {
            hostname: request.hostname().to_string(),
            port: requested(HTTPS_PORT),
        }
    } else if policy.honor_requested_port {
        Decision::Relay {
            hostname: request.hostname().to_string(),
            port: requested(HTTP_PORT),
        }
    } else {
        // plain requests resolve the Host value as sent
        Decision::Relay {
            hostname: request.host().to_string(),
            port: HTTP_PORT,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Nothing usable in the first read; closed without a reply.
    Malformed,
    /// Answered with 403.
    Blocked,
    /// Resolution or connect failed; closed without a reply.
    Unreachable,
    /// Client went away before the relay started.
    ClientGone,
    /// Shutdown arrived before the relay started.
    Cancelled,
    /// Relay ran to completion.
    Relayed(RelayStats),
}

/// State shared by all sessions of one server.
struct Shared {
    config: Arc<AppConfig>,
    blocklist: Arc<BlocklistStore>,
    resolver: HostResolver,
    relay: Relay,
    policy: DispatchPolicy,
}

/// The forwarding proxy server.
#[derive(Clone)]
pub struct ProxyServer {
    shared: Arc<Shared>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    limiter: Option<Arc<Semaphore>>,
}

impl ProxyServer {
    /// Creates a server that checks requests against `blocklist`.
    pub fn new(config: Arc<AppConfig>, blocklist: Arc<BlocklistStore>) -> Self {
        let server = &config.server;
        let limiter = (server.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(server.max_connections)));

        let shared = Shared {
            resolver: HostResolver::new(&config),
            relay: Relay::new(server.buffer_size, server.idle_timeout()),
            policy: DispatchPolicy::from_config(&config),
            blocklist,
            config,
        };

        Self {
            shared: Arc::new(shared),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            limiter,
        }
    }

    /// Token that stops the accept loop and all sessions when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of sessions still running.
    pub fn active_sessions(&self) -> usize {
        self.tracker.len()
    }

    /// Binds the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listen = &self.shared.config.server.listen;
        let listener = TcpListener::bind(listen.as_str()).await?;
        Ok(listener)
    }

    /// Binds and serves until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until the shutdown token fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            max_connections = self.shared.config.server.max_connections,
            blocked_entries = self.shared.blocklist.len(),
            "Proxy server running"
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    permit = limiter.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let server = self.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                let outcome = server.handle_session(stream, peer).await;
                debug!(peer = %peer, outcome = ?outcome, "Session closed");
            });
        }

        info!("Accept loop stopped");
        Ok(())
    }

    /// Stops accepting and waits up to `grace` for running sessions.
    ///
    /// Returns false if sessions were still running when `grace` ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }

    /// Runs one session to completion.
    pub async fn handle_session(&self, mut client: TcpStream, peer: SocketAddr) -> SessionOutcome {
        let shared = &self.shared;
        let cancel = self.shutdown.child_token();

        let mut buf = vec![0u8; shared.config.server.buffer_size];
        let first_read = with_deadline(
            shared.config.server.request_timeout(),
            "request read",
            async { client.read(&mut buf).await.map_err(ProxyError::from) },
        );
        let n = tokio::select! {
            _ = cancel.cancelled() => return SessionOutcome::Cancelled,
            read = first_read => match read {
                Ok(n) if n > 0 => n,
                Ok(_) => return SessionOutcome::Malformed,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "First read failed");
                    return SessionOutcome::Malformed;
                }
            },
        };

        let Some(request) = InboundRequest::sniff(&buf[..n]) else {
            debug!(peer = %peer, bytes = n, "No Host header in first read");
            return SessionOutcome::Malformed;
        };

        info!(
            peer = %peer,
            host = %request.host(),
            connect = request.is_connect(),
            "Request received"
        );

        let decision = decide(&request, &shared.blocklist.snapshot(), shared.policy);
        let (hostname, port, tunnel) = match decision {
            Decision::Blocked => {
                info!(peer = %peer, host = %request.host(), "Blocked");
                let response = forbidden_response(request.host());
                if let Err(e) = client.write_all(response.as_bytes()).await {
                    debug!(peer = %peer, error = %e, "Failed to send 403");
                }
                let _ = client.shutdown().await;
                return SessionOutcome::Blocked;
            }
            Decision::Tunnel { hostname, port } => (hostname, port, true),
            Decision::Relay { hostname, port } => (hostname, port, false),
        };

        let connect = tokio::select! {
            _ = cancel.cancelled() => return SessionOutcome::Cancelled,
            connect = self.connect_origin(&hostname, port) => connect,
        };
        let mut origin = match connect {
            Ok(origin) => origin,
            Err(e) => {
                debug!(peer = %peer, host = %hostname, port, error = %e, "Origin unreachable");
                return SessionOutcome::Unreachable;
            }
        };

        if tunnel {
            if let Err(e) = client.write_all(CONNECTION_ESTABLISHED).await {
                debug!(peer = %peer, error = %e, "Client gone before tunnel start");
                return SessionOutcome::ClientGone;
            }
        } else if let Err(e) = origin.write_all(request.raw()).await {
            debug!(peer = %peer, host = %hostname, error = %e, "Failed to forward request");
            return SessionOutcome::Unreachable;
        }
        drop(request);

        let stats = shared.relay.run(client, origin, cancel).await;
        debug!(
            peer = %peer,
            host = %hostname,
            sent = stats.client_to_origin,
            received = stats.origin_to_client,
            "Relay finished"
        );
        SessionOutcome::Relayed(stats)
    }

    /// Resolves and connects to the origin, within the connect deadline.
    async fn connect_origin(&self, hostname: &str, port: u16) -> Result<TcpStream> {
        let connect = async {
            let resolved = self.shared.resolver.resolve(hostname, port).await?;
            let stream = TcpStream::connect(resolved.addr)
                .await
                .map_err(|source| ProxyError::Connect {
                    addr: resolved.addr,
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            Ok::<_, ProxyError>(stream)
        };
        with_deadline(self.shared.config.server.connect_timeout(), "connect", connect).await
    }
}

async fn with_deadline<T, F>(limit: Option<Duration>, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ProxyError::Timeout { operation })?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sniff(raw: &str) -> InboundRequest {
        InboundRequest::sniff(raw.as_bytes()).unwrap()
    }

    fn blocked(entries: &[&str]) -> BlockedSet {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_forbidden_response_names_host() {
        let response = forbidden_response("ads.example.com");
        assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\nContent-Type: text/html\r\n\r\n"));
        assert!(response.contains("<p>Access to ads.example.com is blocked by the proxy server.</p>"));
    }

    #[test]
    fn test_decide_blocked() {
        let request = sniff("GET / HTTP/1.1\r\nHost: myads.example.com\r\n\r\n");
        let decision = decide(&request, &blocked(&["ads"]), DispatchPolicy::default());
        assert_eq!(decision, Decision::Blocked);
    }

    #[test]
    fn test_decide_connect_always_443_by_default() {
        let request = sniff("CONNECT secure.example.com:8443 HTTP/1.1\r\nHost: secure.example.com:8443\r\n\r\n");
        let decision = decide(&request, &BlockedSet::new(), DispatchPolicy::default());
        assert_eq!(
            decision,
            Decision::Tunnel {
                hostname: "secure.example.com".to_string(),
                port: 443,
            }
        );
    }

    #[test]
    fn test_decide_connect_strips_any_port_suffix() {
        for host in ["example.com:", "example.com:https", "example.com:99999"] {
            let request = sniff(&format!("CONNECT {host} HTTP/1.1\r\nHost: {host}\r\n\r\n"));
            assert_eq!(
                decide(&request, &BlockedSet::new(), DispatchPolicy::default()),
                Decision::Tunnel {
                    hostname: "example.com".to_string(),
                    port: 443
                },
                "host {host}"
            );
        }
    }

    #[test]
    fn test_decide_plain_uses_raw_host_and_port_80() {
        let request = sniff("GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        let decision = decide(&request, &BlockedSet::new(), DispatchPolicy::default());
        assert_eq!(
            decision,
            Decision::Relay {
                hostname: "example.com:8080".to_string(),
                port: 80,
            }
        );
    }

    #[test]
    fn test_decide_honors_requested_port() {
        let policy = DispatchPolicy {
            honor_requested_port: true,
            ..Default::default()
        };

        let request = sniff("CONNECT secure.example.com:8443 HTTP/1.1\r\nHost: secure.example.com:8443\r\n\r\n");
        assert_eq!(
            decide(&request, &BlockedSet::new(), policy),
            Decision::Tunnel {
                hostname: "secure.example.com".to_string(),
                port: 8443,
            }
        );

        let request = sniff("GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        assert_eq!(
            decide(&request, &BlockedSet::new(), policy),
            Decision::Relay {
                hostname: "example.com".to_string(),
                port: 8080,
            }
        );

        let request = sniff("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(
            decide(&request, &BlockedSet::new(), policy),
            Decision::Relay {
                hostname: "example.com".to_string(),
                port: 80,
            }
        );
    }

    #[test]
    fn test_decide_port_suffix_matching() {
        let request = sniff("CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com:8443\r\n\r\n");
        let entries = blocked(&["8443"]);

        assert_eq!(
            decide(&request, &entries, DispatchPolicy::default()),
            Decision::Blocked
        );

        let policy = DispatchPolicy {
            match_port: false,
            ..Default::default()
        };
        assert!(matches!(
            decide(&request, &entries, policy),
            Decision::Tunnel { .. }
        ));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = AppConfig::default();
        assert_eq!(DispatchPolicy::from_config(&config), DispatchPolicy::default());

        config.server.honor_requested_port = true;
        config.blocklist.match_port = false;
        let policy = DispatchPolicy::from_config(&config);
        assert!(policy.honor_requested_port);
        assert!(!policy.match_port);
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let result: Result<()> = with_deadline(
            Some(Duration::from_millis(10)),
            "connect",
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(ProxyError::Timeout { operation: "connect" })));
    }
}
