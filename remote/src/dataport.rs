//! Dataport socket establishment.
//!
//! The side that initiates a session binds one listener per dataport on the
//! address its control connection uses, announces it with `DPORT6`, and
//! accepts the connection the peer makes back. Listeners may be confined
//! to [`PortRanges`] so dataports fit a firewall policy.

use rand::Rng;

use crate::error::{Error, Result};

/// A port range string that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid dataport range {entry:?}: {reason}")]
pub struct PortRangeError {
    entry: String,
    reason: &'static str,
}

/// Ports dataport listeners may bind to, written as `8000-8999,10000,...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRanges {
    ranges: Vec<std::ops::RangeInclusive<u16>>,
}

impl std::str::FromStr for PortRanges {
    type Err = PortRangeError;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = |entry: &str, reason| PortRangeError {
            entry: entry.to_string(),
            reason,
        };
        let port = |entry: &str, value: &str| {
            value
                .trim()
                .parse::<u16>()
                .map_err(|_| invalid(entry, "not a port number"))
        };
        let mut ranges = Vec::new();
        for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let range = match entry.split_once('-') {
                Some((first, last)) => port(entry, first)?..=port(entry, last)?,
                None => {
                    let single = port(entry, entry)?;
                    single..=single
                }
            };
            if *range.start() == 0 {
                return Err(invalid(entry, "port 0 cannot be bound on purpose"));
            }
            if range.is_empty() {
                return Err(invalid(entry, "first port is above last port"));
            }
            ranges.push(range);
        }
        if ranges.is_empty() {
            return Err(invalid(text, "no ports given"));
        }
        Ok(Self { ranges })
    }
}

impl PortRanges {
    /// Number of candidate ports, counting overlaps twice.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| r.clone().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The `index`-th candidate port, ranges taken in the order given.
    fn nth(&self, mut index: usize) -> Option<u16> {
        for range in &self.ranges {
            let count = range.clone().count();
            if index < count {
                return range.clone().nth(index);
            }
            index -= count;
        }
        None
    }

    /// Walk every candidate once, from a random starting point so concurrent
    /// sessions spread over the ranges.
    async fn bind(&self, ip: std::net::IpAddr) -> Result<tokio::net::TcpListener> {
        let total = self.len();
        let start = rand::thread_rng().gen_range(0..total);
        let mut in_use = 0;
        for step in 0..total {
            let Some(port) = self.nth((start + step) % total) else {
                continue;
            };
            match tokio::net::TcpListener::bind(std::net::SocketAddr::new(ip, port)).await {
                Ok(listener) => {
                    tracing::debug!("Bound dataport listener to {ip}:{port} after {in_use} busy port(s)");
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => in_use += 1,
                // any other failure would repeat on every port
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        Err(Error::Transport(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("all {total} dataport range port(s) on {ip} are in use"),
        )))
    }
}

/// Apply the negotiated TCP window to a data or control socket.
///
/// Zero keeps the operating system defaults.
pub fn configure_tcp_buffers(stream: &tokio::net::TcpStream, window: usize) {
    if window == 0 {
        return;
    }
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_send_buffer_size(window) {
        tracing::warn!("Failed to set send buffer size to {window}: {e}");
    }
    if let Err(e) = sock.set_recv_buffer_size(window) {
        tracing::warn!("Failed to set receive buffer size to {window}: {e}");
    }
    tracing::trace!(
        "Socket buffers now snd={:?} rcv={:?}",
        sock.send_buffer_size().ok(),
        sock.recv_buffer_size().ok()
    );
}

/// Bind a dataport listener on `ip`, on an ephemeral port unless `ranges`
/// restricts the choice.
pub async fn bind_listener(
    ip: std::net::IpAddr,
    ranges: Option<&PortRanges>,
) -> Result<tokio::net::TcpListener> {
    match ranges {
        Some(ranges) => ranges.bind(ip).await,
        None => Ok(tokio::net::TcpListener::bind(std::net::SocketAddr::new(ip, 0)).await?),
    }
}

/// Accept the peer's connection to an announced dataport.
pub async fn accept(
    listener: &tokio::net::TcpListener,
    timeout: std::time::Duration,
) -> Result<tokio::net::TcpStream> {
    let (stream, addr) = tokio::time::timeout(timeout, listener.accept())
        .await
        .map_err(|_| {
            Error::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for dataport connection",
            ))
        })??;
    tracing::debug!("Accepted dataport connection from {addr}");
    Ok(stream)
}

/// Connect to a dataport announced by the peer.
pub async fn connect(
    addr: std::net::SocketAddr,
    timeout: std::time::Duration,
) -> Result<tokio::net::TcpStream> {
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
        .await
        .map_err(|_| {
            Error::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("timed out connecting to dataport {addr}"),
            ))
        })??;
    tracing::debug!("Connected to dataport {addr}");
    Ok(stream)
}
