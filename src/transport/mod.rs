//! Transport abstraction layer
//!
//! A peer link runs over exactly one transport session. Sessions provide
//! ordered, reliable, bidirectional substreams with independent half-close
//! per direction; the peer layer multiplexes logical streams and the control
//! channel over them. Three wire transports are supported (QUIC, HTTP/2,
//! WebSocket) plus an in-memory loopback for tests.

pub mod h2;
pub mod memory;
pub mod mux;
pub mod proxy;
pub mod quic;
pub mod tls;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{ListenerConfig, PeerConfig, ProtocolConfig, TlsConfig};

/// Which wire protocol a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Quic,
    H2,
    Ws,
    /// In-process loopback, test meshes only.
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Quic => "quic",
            TransportKind::H2 => "h2",
            TransportKind::Ws => "ws",
            TransportKind::Memory => "memory",
        };
        f.write_str(s)
    }
}

/// Every transport failure collapses to this: a message and whether dialing
/// again can reasonably succeed.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::retryable(e.to_string())
    }
}

/// An ordered, reliable, bidirectional byte pipe. `poll_shutdown` closes the
/// write half only; the read half drains independently.
pub trait Substream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Substream for T {}

pub type BoxedSubstream = Box<dyn Substream>;

/// One live transport connection to a peer.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open a fresh substream toward the peer.
    async fn open_substream(&self) -> Result<BoxedSubstream, TransportError>;

    /// Wait for the peer to open a substream toward us.
    async fn accept_substream(&self) -> Result<BoxedSubstream, TransportError>;

    /// Close the whole session, tearing down every substream.
    async fn close(&self, code: u32, reason: &str);

    fn kind(&self) -> TransportKind;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// DER of the peer's TLS certificate, when the transport has one.
    fn peer_certificate(&self) -> Option<Vec<u8>>;

    /// Negotiated ALPN or WS subprotocol.
    fn negotiated_protocol(&self) -> Option<String>;

    /// Transport-level RTT estimate, when the transport measures one.
    fn transport_rtt(&self) -> Option<Duration>;
}

/// Accept loop handle produced by [`listen`].
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Arc<dyn Session>, TransportError>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Dial an outbound peer session.
pub async fn dial(
    peer: &PeerConfig,
    tls: &TlsConfig,
    protocol: &ProtocolConfig,
) -> Result<Arc<dyn Session>, TransportError> {
    let tls = peer.tls.as_ref().unwrap_or(tls);
    match peer.transport {
        TransportKind::Quic => quic::dial(peer, tls, protocol).await,
        TransportKind::H2 => h2::dial(peer, tls, protocol).await,
        TransportKind::Ws => ws::dial(peer, tls, protocol).await,
        TransportKind::Memory => Err(TransportError::fatal(
            "memory transport cannot be dialed by address",
        )),
    }
}

/// Bind a listener for inbound peer sessions.
pub async fn listen(
    listener: &ListenerConfig,
    tls: &TlsConfig,
    protocol: &ProtocolConfig,
) -> Result<Box<dyn Listener>, TransportError> {
    match listener.transport {
        TransportKind::Quic => quic::listen(listener, tls, protocol).await,
        TransportKind::H2 => h2::listen(listener, tls, protocol).await,
        TransportKind::Ws => ws::listen(listener, tls, protocol).await,
        TransportKind::Memory => Err(TransportError::fatal(
            "memory transport cannot listen on an address",
        )),
    }
}

/// Split "host:port" into its parts for TLS server names and CONNECT lines.
pub(crate) fn split_host_port(address: &str) -> Result<(String, u16), TransportError> {
    // Bracketed IPv6 first, then a plain rsplit on ':'.
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| TransportError::fatal(format!("bad address: {}", address)))?;
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| TransportError::fatal(format!("bad address: {}", address)))?;
        return Ok((host.to_string(), port));
    }
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| TransportError::fatal(format!("address missing port: {}", address)))?;
    let port = port
        .parse()
        .map_err(|_| TransportError::fatal(format!("bad port in address: {}", address)))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com".into(), 443));
        assert_eq!(split_host_port("10.0.0.1:8443").unwrap(), ("10.0.0.1".into(), 8443));
        assert_eq!(split_host_port("[2001:db8::1]:443").unwrap(), ("2001:db8::1".into(), 443));
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("bad:port:here:x").is_err());
    }

    #[test]
    fn test_transport_kind_serde() {
        let kind: TransportKind = serde_json::from_str("\"quic\"").unwrap();
        assert_eq!(kind, TransportKind::Quic);
        assert_eq!(serde_json::to_string(&TransportKind::Ws).unwrap(), "\"ws\"");
    }
}
