//! The probe's dial-and-splice engine.
//!
//! [`ForwardService`] establishes the outbound TCP connection first, then
//! invokes the deferred accept to obtain the client connection, and relays
//! traffic bidirectionally until either side closes. Dial failures are
//! classified into the typed kinds the hub translates for clients.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use scatter_core::conn::{AcceptFn, Conn, Forwarder};
use scatter_core::duplex::duplex;
use scatter_core::error::{ForwardError, ForwardErrorKind};

/// Maximum time to wait when establishing outbound connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Establishes raw network connections to targets.
///
/// Abstracted so tests can instrument the dial path with loopback pipes.
#[async_trait]
pub trait NetDialer: Send + Sync {
    async fn dial(&self, target: &str) -> Result<Conn, ForwardError>;
}

/// Real TCP dialer with DNS resolution and a connect timeout.
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DIAL_TIMEOUT)
    }
}

#[async_trait]
impl NetDialer for TcpDialer {
    async fn dial(&self, target: &str) -> Result<Conn, ForwardError> {
        let addrs: Vec<SocketAddr> = lookup_host(target)
            .await
            .map_err(|e| {
                ForwardError::wrap(
                    ForwardErrorKind::FailedToResolveHost,
                    "failed to resolve target host",
                    e,
                )
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ForwardError::new(
                ForwardErrorKind::FailedToResolveHost,
                "target host has no addresses",
            ));
        }

        let stream = tokio::time::timeout(self.timeout, connect_any(&addrs))
            .await
            .map_err(|_| {
                ForwardError::new(
                    ForwardErrorKind::HostUnreachable,
                    "timed out connecting to target",
                )
            })?
            .map_err(classify_connect_error)?;

        let (reader, writer) = stream.into_split();
        Ok(Conn::from_io("target", reader, writer))
    }
}

/// Tries each resolved address in order, returning the first success.
async fn connect_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses")))
}

fn classify_connect_error(e: io::Error) -> ForwardError {
    let kind = match e.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::AddrNotAvailable => ForwardErrorKind::HostUnreachable,
        _ => ForwardErrorKind::Unknown,
    };
    ForwardError::wrap(kind, "failed to dial target", e)
}

/// Forwarding service backed by a [`NetDialer`].
pub struct ForwardService<D = TcpDialer> {
    dialer: D,
}

impl ForwardService<TcpDialer> {
    pub fn new() -> Self {
        Self {
            dialer: TcpDialer::default(),
        }
    }
}

impl Default for ForwardService<TcpDialer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: NetDialer> ForwardService<D> {
    pub fn with_dialer(dialer: D) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl<D: NetDialer> Forwarder for ForwardService<D> {
    async fn forward<'a>(
        &self,
        target: &str,
        accept: AcceptFn<'a>,
    ) -> Result<(), ForwardError> {
        let target_conn = self.dialer.dial(target).await?;
        debug!(target, "target connection established");

        // Accept the client only once the target connection exists.
        let client_conn = accept().await?;

        duplex(target_conn, client_conn).await;
        Ok(())
    }
}
