//! First-read request sniffing.
//!
//! The proxy never parses HTTP. It only needs to know whether the client
//! asked for a `CONNECT` tunnel and what the `Host:` header says, and it
//! takes both from whatever the first read delivered.

use tracing::trace;

const CONNECT_TOKEN: &[u8] = b"CONNECT";
const HOST_MARKER: &[u8] = b"Host: ";
const CRLF: &[u8] = b"\r\n";

/// What a client sent in its first read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    raw: Vec<u8>,
    is_connect: bool,
    host: String,
}

impl InboundRequest {
    /// Sniffs the method and Host value from `buf`.
    ///
    /// Returns `None` when the `Host: ` marker or its terminating CRLF is not
    /// inside `buf`, or when the value is empty or not UTF-8. Bytes arriving
    /// in later reads are never consulted.
    pub fn sniff(buf: &[u8]) -> Option<Self> {
        let start = find(buf, HOST_MARKER, 0)? + HOST_MARKER.len();
        let end = find(buf, CRLF, start)?;
        let host = std::str::from_utf8(&buf[start..end]).ok()?;
        if host.is_empty() {
            return None;
        }

        let request = Self {
            raw: buf.to_vec(),
            is_connect: buf.starts_with(CONNECT_TOKEN),
            host: host.to_string(),
        };
        trace!(host = %request.host, connect = request.is_connect, "Sniffed request");
        Some(request)
    }

    /// The bytes received, unmodified.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_connect(&self) -> bool {
        self.is_connect
    }

    /// The Host value exactly as sent, including any `:port`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The Host value with any `:port` suffix removed, valid port or not.
    pub fn hostname(&self) -> &str {
        strip_port(&self.host)
    }

    /// The explicit port in the Host value, if there is a valid one.
    pub fn requested_port(&self) -> Option<u16> {
        split_host_port(&self.host).1
    }

}

/// Drops everything from the last `:` outside `[...]`.
pub fn strip_port(host: &str) -> &str {
    let tail = match host.find(']') {
        Some(bracket) if host.starts_with('[') => bracket,
        _ => 0,
    };
    match host[tail..].rfind(':') {
        Some(colon) => &host[..tail + colon],
        None => host,
    }
}

/// Splits `host[:port]`, keeping IPv6 literals like `[::1]:8080` intact.
///
/// A suffix that is not a valid port is left on the host.
pub fn split_host_port(host: &str) -> (&str, Option<u16>) {
    let Some(colon) = host.rfind(':') else {
        return (host, None);
    };

    if host.starts_with('[') {
        match host.find(']') {
            Some(bracket) if colon > bracket => {}
            // IPv6 without port
            _ => return (host, None),
        }
    }

    match host[colon + 1..].parse() {
        Ok(port) => (&host[..colon], Some(port)),
        Err(_) => (host, None),
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
