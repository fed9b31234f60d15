//! Bidirectional byte relay between a client and an origin.
//!
//! Each direction is its own task: it reads a chunk, writes it unchanged,
//! and on EOF or error shuts down its destination and stops. The two pumps
//! never interrupt each other; a pump that stops closes the write side the
//! other pump's peer is reading from, which ends the other pump on its
//! next cycle.

use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Direction of a single pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToOrigin,
    OriginToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToOrigin => f.write_str("client->origin"),
            Direction::OriginToClient => f.write_str("origin->client"),
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Source reached end of stream.
    Eof,
    /// A read or write failed.
    Error,
    /// No data arrived within the idle limit.
    Idle,
    /// The session was cancelled.
    Cancelled,
}

/// Bytes moved by one finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

/// Relay settings shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct Relay {
    buffer_size: usize,
    idle_timeout: Option<Duration>,
}

impl Relay {
    pub fn new(buffer_size: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            buffer_size,
            idle_timeout,
        }
    }

    /// Runs both pumps until each has stopped.
    ///
    /// Takes ownership of both streams; they are closed when this returns.
    pub async fn run<C, O>(&self, client: C, origin: O, cancel: CancellationToken) -> RelayStats
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        O: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (origin_read, origin_write) = tokio::io::split(origin);

        let upstream = tokio::spawn(pump(
            client_read,
            origin_write,
            *self,
            Direction::ClientToOrigin,
            cancel.clone(),
        ));
        let downstream = tokio::spawn(pump(
            origin_read,
            client_write,
            *self,
            Direction::OriginToClient,
            cancel,
        ));

        let (up, down) = tokio::join!(upstream, downstream);
        RelayStats {
            client_to_origin: up.map(|(n, _)| n).unwrap_or(0),
            origin_to_client: down.map(|(n, _)| n).unwrap_or(0),
        }
    }
}

/// Copies `src` into `dst` until one of them gives out, then shuts `dst`.
pub async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    relay: Relay,
    direction: Direction,
    cancel: CancellationToken,
) -> (u64, PumpEnd)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; relay.buffer_size];
    let mut total = 0u64;

    let end = loop {
        let read = async {
            match relay.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, src.read(&mut buf)).await.ok(),
                None => Some(src.read(&mut buf).await),
            }
        };

        let n = tokio::select! {
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            read = read => match read {
                None => break PumpEnd::Idle,
                Some(Ok(0)) => break PumpEnd::Eof,
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    trace!(%direction, error = %e, "Relay read failed");
                    break PumpEnd::Error;
                }
            },
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            trace!(%direction, error = %e, "Relay write failed");
            break PumpEnd::Error;
        }
        total += n as u64;
    };

    let _ = dst.shutdown().await;
    debug!(%direction, bytes = total, end = ?end, "Pump finished");
    (total, end)
}
