//! In-process loopback transport
//!
//! Backs test meshes: a connected pair of sessions exchanging duplex pipes
//! through channels, no sockets involved.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{BoxedSubstream, Session, TransportError, TransportKind};

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct MemorySession {
    to_peer: mpsc::Sender<DuplexStream>,
    from_peer: Mutex<mpsc::Receiver<DuplexStream>>,
    closed: CancellationToken,
}

/// A connected pair of sessions. Substreams opened on one side pop out of
/// `accept_substream` on the other.
pub fn pair() -> (Arc<MemorySession>, Arc<MemorySession>) {
    let (a_tx, a_rx) = mpsc::channel(16);
    let (b_tx, b_rx) = mpsc::channel(16);
    let closed = CancellationToken::new();
    let a = Arc::new(MemorySession {
        to_peer: b_tx,
        from_peer: Mutex::new(a_rx),
        closed: closed.clone(),
    });
    let b = Arc::new(MemorySession {
        to_peer: a_tx,
        from_peer: Mutex::new(b_rx),
        closed,
    });
    (a, b)
}

#[async_trait]
impl Session for MemorySession {
    async fn open_substream(&self) -> Result<BoxedSubstream, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::fatal("session closed"));
        }
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        self.to_peer
            .send(theirs)
            .await
            .map_err(|_| TransportError::fatal("peer side dropped"))?;
        Ok(Box::new(ours))
    }

    async fn accept_substream(&self) -> Result<BoxedSubstream, TransportError> {
        let mut rx = self.from_peer.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::fatal("session closed")),
            sub = rx.recv() => match sub {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(TransportError::fatal("peer side dropped")),
            },
        }
    }

    async fn close(&self, _code: u32, _reason: &str) {
        self.closed.cancel();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        None
    }

    fn negotiated_protocol(&self) -> Option<String> {
        None
    }

    fn transport_rtt(&self) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_substream_roundtrip() {
        let (a, b) = pair();

        let mut opened = a.open_substream().await.unwrap();
        let mut accepted = b.accept_substream().await.unwrap();

        opened.write_all(b"ping").await.unwrap();
        opened.flush().await.unwrap();

        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_half_close_delivers_eof_after_data() {
        let (a, b) = pair();
        let mut opened = a.open_substream().await.unwrap();
        let mut accepted = b.accept_substream().await.unwrap();

        opened.write_all(b"tail").await.unwrap();
        opened.shutdown().await.unwrap();

        let mut out = Vec::new();
        accepted.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"tail");

        // Write half of the acceptor still works after reading EOF.
        accepted.write_all(b"reply").await.unwrap();
        let mut reply = [0u8; 5];
        opened.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let (a, _b) = pair();
        a.close(0, "done").await;
        assert!(a.accept_substream().await.is_err());
        assert!(a.open_substream().await.is_err());
    }
}
