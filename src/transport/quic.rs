//! QUIC transport
//!
//! The most capable of the three: native bidirectional streams map straight
//! onto substreams, and the connection gives us an RTT estimate for free.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{
    split_host_port, BoxedSubstream, Listener, Session, TransportError, TransportKind,
};
use crate::config::{ListenerConfig, PeerConfig, ProtocolConfig, TlsConfig};

/// One QUIC bidi stream pair as a substream.
pub struct QuicSubstream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for QuicSubstream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicSubstream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

pub struct QuicSession {
    connection: quinn::Connection,
}

#[async_trait]
impl Session for QuicSession {
    async fn open_substream(&self) -> Result<BoxedSubstream, TransportError> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::retryable(format!("open_bi: {}", e)))?;
        Ok(Box::new(QuicSubstream { send, recv }))
    }

    async fn accept_substream(&self) -> Result<BoxedSubstream, TransportError> {
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::retryable(format!("accept_bi: {}", e)))?;
        Ok(Box::new(QuicSubstream { send, recv }))
    }

    async fn close(&self, code: u32, reason: &str) {
        self.connection
            .close(quinn::VarInt::from_u32(code), reason.as_bytes());
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.connection.remote_address())
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.connection
            .peer_identity()
            .and_then(|identity| {
                identity
                    .downcast::<Vec<rustls::pki_types::CertificateDer<'static>>>()
                    .ok()
            })
            .and_then(|certs| certs.first().map(|c| c.as_ref().to_vec()))
    }

    fn negotiated_protocol(&self) -> Option<String> {
        self.connection
            .handshake_data()
            .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
            .and_then(|data| data.protocol)
            .map(|alpn| String::from_utf8_lossy(&alpn).into_owned())
    }

    fn transport_rtt(&self) -> Option<Duration> {
        Some(self.connection.rtt())
    }
}

pub async fn dial(
    peer: &PeerConfig,
    tls: &TlsConfig,
    protocol: &ProtocolConfig,
) -> Result<Arc<dyn Session>, TransportError> {
    let (host, port) = split_host_port(&peer.address)?;
    let remote: SocketAddr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| TransportError::retryable(format!("no address for {}", host)))?;

    let crypto = super::tls::client_config(tls, protocol)?;
    let client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| TransportError::fatal(format!("quic crypto: {}", e)))?,
    ));

    let bind: SocketAddr = if remote.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let endpoint = quinn::Endpoint::client(bind)
        .map_err(|e| TransportError::fatal(format!("quic endpoint: {}", e)))?;

    let connection = endpoint
        .connect_with(client_config, remote, &host)
        .map_err(|e| TransportError::fatal(format!("quic connect: {}", e)))?
        .await
        .map_err(|e| TransportError::retryable(format!("quic handshake: {}", e)))?;

    log::debug!("[QUIC] Connected to {}", peer.address);
    Ok(Arc::new(QuicSession { connection }))
}

pub struct QuicListener {
    endpoint: quinn::Endpoint,
}

pub async fn listen(
    listener: &ListenerConfig,
    tls: &TlsConfig,
    protocol: &ProtocolConfig,
) -> Result<Box<dyn Listener>, TransportError> {
    let crypto = super::tls::server_config(tls, protocol)?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| TransportError::fatal(format!("quic crypto: {}", e)))?,
    ));
    let endpoint = quinn::Endpoint::server(server_config, listener.address)
        .map_err(|e| TransportError::fatal(format!("quic bind: {}", e)))?;
    log::info!("[QUIC] Listening on {}", listener.address);
    Ok(Box::new(QuicListener { endpoint }))
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&self) -> Result<Arc<dyn Session>, TransportError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| TransportError::fatal("quic endpoint closed"))?;
        let connection = incoming
            .await
            .map_err(|e| TransportError::retryable(format!("quic accept: {}", e)))?;
        log::debug!("[QUIC] Accepted connection from {}", connection.remote_address());
        Ok(Arc::new(QuicSession { connection }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }
}
