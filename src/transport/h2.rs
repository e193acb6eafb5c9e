//! HTTP/2 transport
//!
//! One TLS connection per peer session; every substream is an HTTP/2
//! request whose request and response bodies form the two directions.
//! HTTP/2 only lets the client originate requests, so the dialer parks one
//! spare request flagged `x-weft-reverse` on the server at all times: when
//! the listening side needs to open a substream it answers that parked
//! request and the dialer hands the pair to its accept queue.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::ready;
use http::{Request, Response};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::{
    split_host_port, BoxedSubstream, Listener, Session, TransportError, TransportKind,
};
use crate::config::{ListenerConfig, PeerConfig, ProtocolConfig, TlsConfig};

const REVERSE_HEADER: &str = "x-weft-reverse";

enum RecvState {
    /// Client side: response headers not seen yet.
    Pending(h2::client::ResponseFuture),
    Ready(h2::RecvStream),
}

/// A request/response body pair as a substream.
pub struct H2Substream {
    send: h2::SendStream<Bytes>,
    recv: RecvState,
    read_buf: Bytes,
    wrote_eos: bool,
}

impl H2Substream {
    fn new_client(send: h2::SendStream<Bytes>, response: h2::client::ResponseFuture) -> Self {
        Self {
            send,
            recv: RecvState::Pending(response),
            read_buf: Bytes::new(),
            wrote_eos: false,
        }
    }

    fn new_ready(send: h2::SendStream<Bytes>, recv: h2::RecvStream) -> Self {
        Self {
            send,
            recv: RecvState::Ready(recv),
            read_buf: Bytes::new(),
            wrote_eos: false,
        }
    }
}

fn h2_io_err(e: h2::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string())
}

impl AsyncRead for H2Substream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            match &mut self.recv {
                RecvState::Pending(response) => {
                    let resp = ready!(Pin::new(response).poll(cx)).map_err(h2_io_err)?;
                    if !resp.status().is_success() {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            format!("h2 substream rejected: {}", resp.status()),
                        )));
                    }
                    self.recv = RecvState::Ready(resp.into_body());
                }
                RecvState::Ready(recv) => match ready!(recv.poll_data(cx)) {
                    Some(Ok(chunk)) => {
                        let _ = recv.flow_control().release_capacity(chunk.len());
                        self.read_buf = chunk;
                    }
                    Some(Err(e)) => return Poll::Ready(Err(h2_io_err(e))),
                    None => return Poll::Ready(Ok(())),
                },
            }
        }
    }
}

impl AsyncWrite for H2Substream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.send.reserve_capacity(buf.len());
        match ready!(self.send.poll_capacity(cx)) {
            Some(Ok(capacity)) => {
                let n = capacity.min(buf.len());
                self.send
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .map_err(h2_io_err)?;
                Poll::Ready(Ok(n))
            }
            Some(Err(e)) => Poll::Ready(Err(h2_io_err(e))),
            None => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "h2 stream closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if !self.wrote_eos {
            self.send.send_data(Bytes::new(), true).map_err(h2_io_err)?;
            self.wrote_eos = true;
        }
        Poll::Ready(Ok(()))
    }
}

fn build_request(path: &str, protocol: &ProtocolConfig, reverse: bool) -> Request<()> {
    let mut builder = Request::post(path);
    if reverse {
        builder = builder.header(REVERSE_HEADER, "1");
    }
    if let Some(header) = &protocol.http_header {
        if let Some((name, value)) = header.split_once(':') {
            builder = builder.header(name.trim(), value.trim());
        }
    }
    builder.body(()).expect("static request")
}

pub struct H2ClientSession {
    send_request: h2::client::SendRequest<Bytes>,
    accept_rx: Mutex<mpsc::Receiver<H2Substream>>,
    path: String,
    protocol: ProtocolConfig,
    remote_addr: Option<SocketAddr>,
    peer_cert: Option<Vec<u8>>,
    alpn: Option<String>,
    closed: CancellationToken,
}

#[async_trait]
impl Session for H2ClientSession {
    async fn open_substream(&self) -> Result<BoxedSubstream, TransportError> {
        let send_request = self.send_request.clone();
        let mut ready = send_request
            .ready()
            .await
            .map_err(|e| TransportError::retryable(format!("h2 not ready: {}", e)))?;
        let (response, send) = ready
            .send_request(build_request(&self.path, &self.protocol, false), false)
            .map_err(|e| TransportError::retryable(format!("h2 request: {}", e)))?;
        Ok(Box::new(H2Substream::new_client(send, response)))
    }

    async fn accept_substream(&self) -> Result<BoxedSubstream, TransportError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::retryable("h2 session closed")),
            sub = rx.recv() => sub
                .map(|s| Box::new(s) as BoxedSubstream)
                .ok_or_else(|| TransportError::retryable("h2 session closed")),
        }
    }

    async fn close(&self, _code: u32, _reason: &str) {
        self.closed.cancel();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::H2
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_cert.clone()
    }

    fn negotiated_protocol(&self) -> Option<String> {
        self.alpn.clone()
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
    let (host, _port) = split_host_port(&peer.address)?;
    let tcp = super::proxy::connect(&peer.address, peer.proxy.as_deref(), peer.proxy_auth.as_deref())
        .await?;
    let remote_addr = tcp.peer_addr().ok();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(super::tls::client_config(
        tls, protocol,
    )?));
    let server_name = rustls::pki_types::ServerName::try_from(host.clone())
        .map_err(|_| TransportError::fatal(format!("bad server name: {}", host)))?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::retryable(format!("tls handshake: {}", e)))?;
    let (peer_cert, alpn) = {
        let conn = &tls_stream.get_ref().1;
        (
            conn.peer_certificates()
                .and_then(|certs| certs.first())
                .map(|c| c.as_ref().to_vec()),
            conn.alpn_protocol()
                .map(|alpn| String::from_utf8_lossy(alpn).into_owned()),
        )
    };

    let (send_request, connection) = h2::client::handshake(tls_stream)
        .await
        .map_err(|e| TransportError::retryable(format!("h2 handshake: {}", e)))?;
    let closed = CancellationToken::new();
    {
        let closed = closed.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("[H2] Connection ended: {}", e);
            }
            closed.cancel();
        });
    }

    // Keep one reverse slot parked on the server so it can open substreams
    // toward us despite HTTP/2's client-initiated stream model.
    let (accept_tx, accept_rx) = mpsc::channel(16);
    {
        let send_request = send_request.clone();
        let closed = closed.clone();
        let path = peer.path.clone();
        let protocol = protocol.clone();
        tokio::spawn(async move {
            loop {
                if closed.is_cancelled() {
                    break;
                }
                let slot = async {
                    let mut ready = send_request.clone().ready().await?;
                    let (response, send) =
                        ready.send_request(build_request(&path, &protocol, true), false)?;
                    let resp = response.await?;
                    Ok::<_, h2::Error>((resp, send))
                };
                tokio::select! {
                    _ = closed.cancelled() => break,
                    result = slot => match result {
                        Ok((resp, send)) if resp.status().is_success() => {
                            let sub = H2Substream::new_ready(send, resp.into_body());
                            if accept_tx.send(sub).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) | Err(_) => {
                            // Server not accepting reverse slots right now.
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                }
            }
        });
    }

    log::debug!("[H2] Connected to {}", peer.address);
    Ok(Arc::new(H2ClientSession {
        send_request,
        accept_rx: Mutex::new(accept_rx),
        path: peer.path.clone(),
        protocol: protocol.clone(),
        remote_addr,
        peer_cert,
        alpn,
        closed,
    }))
}

pub struct H2ServerSession {
    accept_rx: Mutex<mpsc::Receiver<H2Substream>>,
    reverse_rx: Mutex<mpsc::Receiver<(h2::RecvStream, h2::server::SendResponse<Bytes>)>>,
    remote_addr: Option<SocketAddr>,
    peer_cert: Option<Vec<u8>>,
    alpn: Option<String>,
    closed: CancellationToken,
}

#[async_trait]
impl Session for H2ServerSession {
    async fn open_substream(&self) -> Result<BoxedSubstream, TransportError> {
        // Claim a parked reverse request and answer it.
        let mut rx = self.reverse_rx.lock().await;
        let (recv, mut respond) = tokio::select! {
            _ = self.closed.cancelled() =>
                return Err(TransportError::retryable("h2 session closed")),
            slot = rx.recv() => slot
                .ok_or_else(|| TransportError::retryable("h2 session closed"))?,
        };
        drop(rx);
        let resp = Response::builder().status(200).body(()).expect("static response");
        let send = respond
            .send_response(resp, false)
            .map_err(|e| TransportError::retryable(format!("h2 response: {}", e)))?;
        Ok(Box::new(H2Substream::new_ready(send, recv)))
    }

    async fn accept_substream(&self) -> Result<BoxedSubstream, TransportError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::retryable("h2 session closed")),
            sub = rx.recv() => sub
                .map(|s| Box::new(s) as BoxedSubstream)
                .ok_or_else(|| TransportError::retryable("h2 session closed")),
        }
    }

    async fn close(&self, _code: u32, _reason: &str) {
        self.closed.cancel();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::H2
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_cert.clone()
    }

    fn negotiated_protocol(&self) -> Option<String> {
        self.alpn.clone()
    }

    fn transport_rtt(&self) -> Option<Duration> {
        None
    }
}

pub struct H2Listener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
}

pub async fn listen(
    listener: &ListenerConfig,
    tls: &TlsConfig,
    protocol: &ProtocolConfig,
) -> Result<Box<dyn Listener>, TransportError> {
    let tcp = TcpListener::bind(listener.address).await?;
    let acceptor = TlsAcceptor::from(Arc::new(super::tls::server_config(tls, protocol)?));
    log::info!("[H2] Listening on {}", listener.address);
    Ok(Box::new(H2Listener { tcp, acceptor }))
}

#[async_trait]
impl Listener for H2Listener {
    async fn accept(&self) -> Result<Arc<dyn Session>, TransportError> {
        let (tcp, remote_addr) = self.tcp.accept().await?;
        let tls_stream = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| TransportError::retryable(format!("tls accept: {}", e)))?;
        let (peer_cert, alpn) = {
            let conn = &tls_stream.get_ref().1;
            (
                conn.peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|c| c.as_ref().to_vec()),
                conn.alpn_protocol()
                    .map(|alpn| String::from_utf8_lossy(alpn).into_owned()),
            )
        };

        let mut connection = h2::server::handshake(tls_stream)
            .await
            .map_err(|e| TransportError::retryable(format!("h2 handshake: {}", e)))?;

        let (accept_tx, accept_rx) = mpsc::channel::<H2Substream>(16);
        let (reverse_tx, reverse_rx) = mpsc::channel(4);
        let closed = CancellationToken::new();
        {
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let request = tokio::select! {
                        _ = closed.cancelled() => break,
                        req = connection.accept() => req,
                    };
                    match request {
                        Some(Ok((req, mut respond))) => {
                            let reverse = req.headers().contains_key(REVERSE_HEADER);
                            let recv = req.into_body();
                            if reverse {
                                if reverse_tx.send((recv, respond)).await.is_err() {
                                    break;
                                }
                            } else {
                                let resp = Response::builder()
                                    .status(200)
                                    .body(())
                                    .expect("static response");
                                match respond.send_response(resp, false) {
                                    Ok(send) => {
                                        let sub = H2Substream::new_ready(send, recv);
                                        if accept_tx.send(sub).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => log::debug!("[H2] send_response: {}", e),
                                }
                            }
                        }
                        Some(Err(e)) => {
                            log::debug!("[H2] Accept stream error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
                closed.cancel();
            });
        }

        Ok(Arc::new(H2ServerSession {
            accept_rx: Mutex::new(accept_rx),
            reverse_rx: Mutex::new(reverse_rx),
            remote_addr: Some(remote_addr),
            peer_cert,
            alpn,
            closed,
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr().ok()
    }
}
