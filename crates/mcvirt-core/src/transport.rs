//! Peer transport abstraction.
//!
//! Two implementations:
//! - [`TcpTransport`](crate::tcp_transport::TcpTransport) for plain TCP
//! - [`TlsTransport`](crate::tls::TlsTransport) for TLS, trusting each
//!   peer through the CA certificate exchanged when it joined
//!
//! The daemon's remote client, and through it every saga fan-out, talks to
//! peers only through this trait, so tests can route requests in-process.

use std::fmt;

use async_trait::async_trait;
use mcvirt_proto::{Envelope, McvResult, Request, Response};

/// Where a peer daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    /// Node name; also the TLS server name.
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(hostname: &str, ip_address: &str, port: u16) -> Self {
        Self {
            hostname: hostname.to_string(),
            ip_address: ip_address.to_string(),
            port,
        }
    }

    /// Key used for connection pooling.
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.hostname, self.ip_address, self.port)
    }
}

/// Abstraction over the daemon-to-daemon (and CLI-to-daemon) transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Human-readable name for logging ("tcp", "tls").
    fn name(&self) -> &str;

    /// Send a request to a peer and await the response.
    async fn send_request(
        &self,
        peer: &PeerAddr,
        envelope: Envelope,
        req: Request,
    ) -> McvResult<Response>;

    /// Forget cached state for a peer that left the cluster.
    fn forget_peer(&self, _hostname: &str) {}

    /// Drop any pooled connections.
    async fn shutdown(&self) -> McvResult<()>;
}
