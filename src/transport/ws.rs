//! WebSocket transport
//!
//! A single WebSocket upgrade per peer session; substreams ride the mux
//! framing from [`super::mux`]. TLS 1.3 by default, with `plaintext`
//! listeners allowed for reverse-proxy front-ends that terminate TLS
//! themselves.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{Request as AcceptRequest, Response as AcceptResponse};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::mux::{MuxCore, MuxFrame};
use super::{
    split_host_port, BoxedSubstream, Listener, Session, TransportError, TransportKind,
};
use crate::config::{ListenerConfig, PeerConfig, ProtocolConfig, TlsConfig};

pub struct WsSession {
    core: Arc<MuxCore>,
    remote_addr: Option<SocketAddr>,
    peer_cert: Option<Vec<u8>>,
    subprotocol: Option<String>,
    closed: CancellationToken,
}

impl WsSession {
    /// Wrap an upgraded socket: spawn the pump that moves frames between the
    /// WebSocket and the mux core.
    fn start<S>(
        ws: WebSocketStream<S>,
        dialer: bool,
        remote_addr: Option<SocketAddr>,
        peer_cert: Option<Vec<u8>>,
        subprotocol: Option<String>,
    ) -> Arc<Self>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (core, out_rx) = MuxCore::new(dialer);
        let closed = CancellationToken::new();
        let session = Arc::new(Self {
            core: Arc::clone(&core),
            remote_addr,
            peer_cert,
            subprotocol,
            closed: closed.clone(),
        });
        tokio::spawn(pump(ws, core, out_rx, closed));
        session
    }
}

/// Single task owning the socket: drains outgoing mux frames and dispatches
/// incoming messages. Ends on close, error, or cancellation.
async fn pump<S>(
    mut ws: WebSocketStream<S>,
    core: Arc<MuxCore>,
    mut out_rx: mpsc::Receiver<MuxFrame>,
    closed: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                let _ = ws.close(None).await;
                break;
            }
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws.send(Message::Binary(frame.encode())).await {
                        log::debug!("[WS] Send failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(raw))) => match MuxFrame::decode(&raw) {
                    Ok(frame) => core.handle_incoming(frame).await,
                    Err(e) => {
                        log::warn!("[WS] Bad mux frame: {}", e);
                        break;
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("[WS] Receive failed: {}", e);
                    break;
                }
            },
        }
    }
    core.reset_all();
    closed.cancel();
}

#[async_trait]
impl Session for WsSession {
    async fn open_substream(&self) -> Result<BoxedSubstream, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::retryable("ws session closed"));
        }
        Ok(Box::new(self.core.open().await?))
    }

    async fn accept_substream(&self) -> Result<BoxedSubstream, TransportError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::retryable("ws session closed")),
            sub = self.core.accept() => Ok(Box::new(sub?)),
        }
    }

    async fn close(&self, _code: u32, _reason: &str) {
        self.closed.cancel();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Ws
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_cert.clone()
    }

    fn negotiated_protocol(&self) -> Option<String> {
        self.subprotocol.clone()
    }

    fn transport_rtt(&self) -> Option<Duration> {
        None
    }
}

pub async fn dial(
    peer: &PeerConfig,
    tls: &TlsConfig,
    protocol: &ProtocolConfig,
) -> Result<Arc<dyn Session>, TransportError> {
    let (host, port) = split_host_port(&peer.address)?;
    let tcp = super::proxy::connect(&peer.address, peer.proxy.as_deref(), peer.proxy_auth.as_deref())
        .await?;
    let remote_addr = tcp.peer_addr().ok();

    let url = format!("wss://{}:{}{}", host, port, peer.path);
    let mut request = Request::builder()
        .uri(&url)
        .header("Host", format!("{}:{}", host, port))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        );
    if let Some(subprotocol) = &protocol.ws_subprotocol {
        request = request.header("Sec-WebSocket-Protocol", subprotocol.as_str());
    }
    if let Some(header) = &protocol.http_header {
        if let Some((name, value)) = header.split_once(':') {
            request = request.header(name.trim(), value.trim());
        }
    }
    let request = request
        .body(())
        .map_err(|e| TransportError::fatal(format!("bad ws request: {}", e)))?;

    // TLS unless the peer is fronted by a plaintext reverse proxy; the
    // config models that with the ws+plaintext listener, so dialers always
    // speak TLS here.
    let connector = tokio_rustls::TlsConnector::from(Arc::new(super::tls::client_config(
        tls, protocol,
    )?));
    let server_name = rustls::pki_types::ServerName::try_from(host.clone())
        .map_err(|_| TransportError::fatal(format!("bad server name: {}", host)))?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::retryable(format!("tls handshake: {}", e)))?;
    let peer_cert = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|c| c.as_ref().to_vec());

    let (ws, response) = tokio_tungstenite::client_async(request, tls_stream)
        .await
        .map_err(|e| TransportError::retryable(format!("ws handshake: {}", e)))?;
    let subprotocol = response
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    log::debug!("[WS] Connected to {}", peer.address);
    let session: Arc<dyn Session> = WsSession::start(ws, true, remote_addr, peer_cert, subprotocol);
    Ok(session)
}

pub struct WsListener {
    tcp: TcpListener,
    acceptor: Option<TlsAcceptor>,
    subprotocol: Option<String>,
    path: String,
}

pub async fn listen(
    listener: &ListenerConfig,
    tls: &TlsConfig,
    protocol: &ProtocolConfig,
) -> Result<Box<dyn Listener>, TransportError> {
    let tcp = TcpListener::bind(listener.address).await?;
    let acceptor = if listener.plaintext {
        None
    } else {
        Some(TlsAcceptor::from(Arc::new(super::tls::server_config(
            tls, protocol,
        )?)))
    };
    log::info!(
        "[WS] Listening on {}{}",
        listener.address,
        if listener.plaintext { " (plaintext)" } else { "" }
    );
    Ok(Box::new(WsListener {
        tcp,
        acceptor,
        subprotocol: protocol.ws_subprotocol.clone(),
        path: listener.path.clone(),
    }))
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&self) -> Result<Arc<dyn Session>, TransportError> {
        let (tcp, remote_addr) = self.tcp.accept().await?;
        let expected_path = self.path.clone();
        let subprotocol = self.subprotocol.clone();

        let check = move |req: &AcceptRequest, mut resp: AcceptResponse| {
            if req.uri().path() != expected_path {
                return Err(tokio_tungstenite::tungstenite::http::Response::builder()
                    .status(404)
                    .body(None::<String>)
                    .unwrap());
            }
            if let Some(sub) = &subprotocol {
                resp.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    sub.parse().map_err(|_| {
                        tokio_tungstenite::tungstenite::http::Response::builder()
                            .status(400)
                            .body(None::<String>)
                            .unwrap()
                    })?,
                );
            }
            Ok(resp)
        };

        match &self.acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| TransportError::retryable(format!("tls accept: {}", e)))?;
                let peer_cert = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|c| c.as_ref().to_vec());
                let ws = tokio_tungstenite::accept_hdr_async(tls_stream, check)
                    .await
                    .map_err(|e| TransportError::retryable(format!("ws accept: {}", e)))?;
                Ok(WsSession::start(ws, false, Some(remote_addr), peer_cert, None))
            }
            None => {
                let ws = tokio_tungstenite::accept_hdr_async(tcp, check)
                    .await
                    .map_err(|e| TransportError::retryable(format!("ws accept: {}", e)))?;
                Ok(WsSession::start(ws, false, Some(remote_addr), None, None))
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr().ok()
    }
}
