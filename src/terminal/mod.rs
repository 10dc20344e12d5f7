//! Collaborators at the edges of the protocol engine: the SSL terminal that
//! yields an upgraded byte stream, and the IP terminal that exchanges raw IP
//! packets with the host.

pub mod tls;
#[cfg(unix)]
pub mod tun;

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::types::NetworkAddresses;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Negotiated TLS parameters, for logs.
#[derive(Debug, Clone, Default)]
pub struct TlsDiagnostics {
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
}

impl fmt::Display for TlsDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.protocol_version.as_deref().unwrap_or("unknown"),
            self.cipher_suite.as_deref().unwrap_or("unknown")
        )
    }
}

/// Connected, upgraded SSTP stream.
pub struct SslConnection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// DER of the server's leaf certificate, hashed into the crypto binding.
    pub peer_certificate: Vec<u8>,
    pub correlation_id: Uuid,
    pub diagnostics: TlsDiagnostics,
}

/// Performs the TLS handshake and the HTTPS upgrade.
#[async_trait]
pub trait SslDialer: Send + Sync {
    async fn connect(&self, config: &ClientConfig) -> Result<SslConnection>;
}

/// Host side of the tunnel.
#[async_trait]
pub trait IpTerminal: Send + Sync {
    /// Read one network-layer packet into `buf`, returning its length.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    async fn close(&self);
}

/// Creates the IP terminal once the network phases have opened.
#[async_trait]
pub trait IpTerminalFactory: Send + Sync {
    async fn establish(
        &self,
        mtu: u16,
        addresses: &NetworkAddresses,
    ) -> Result<Arc<dyn IpTerminal>>;
}
