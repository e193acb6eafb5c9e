//! Substream multiplexing over a single message pipe
//!
//! The WebSocket transport carries all substreams over one upgraded socket.
//! Each binary message is `{stream_id: u32 BE, flags: u8, payload}`; SYN
//! opens a stream, FIN closes the sender's write half, RST aborts. Dialers
//! allocate odd IDs and listeners even ones so the two sides never collide.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::ready;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use super::TransportError;

pub const FLAG_SYN: u8 = 0x01;
pub const FLAG_FIN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;

/// Largest payload put into a single mux frame.
pub const MAX_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub stream_id: u32,
    pub flags: u8,
    pub payload: Bytes,
}

impl MuxFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.flags);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, TransportError> {
        if raw.len() < 5 {
            return Err(TransportError::fatal("short mux frame"));
        }
        let mut header = &raw[..5];
        let stream_id = header.get_u32();
        let flags = header.get_u8();
        Ok(Self {
            stream_id,
            flags,
            payload: Bytes::copy_from_slice(&raw[5..]),
        })
    }
}

/// Shared mux state: open streams, the accept queue, and the outgoing frame
/// channel drained by the transport's pump task.
pub struct MuxCore {
    next_id: AtomicU32,
    out_tx: mpsc::Sender<MuxFrame>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    accept_tx: mpsc::Sender<MuxSubstream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxSubstream>>,
}

impl MuxCore {
    /// Build a core. `dialer` picks the ID parity. The returned receiver is
    /// the stream of frames the pump must push onto the wire.
    pub fn new(dialer: bool) -> (Arc<Self>, mpsc::Receiver<MuxFrame>) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let core = Arc::new(Self {
            next_id: AtomicU32::new(if dialer { 1 } else { 2 }),
            out_tx,
            streams: Mutex::new(HashMap::new()),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        });
        (core, out_rx)
    }

    fn register(&self, stream_id: u32) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(32);
        self.streams.lock().insert(stream_id, tx);
        rx
    }

    fn substream(self: &Arc<Self>, stream_id: u32, data_rx: mpsc::Receiver<Bytes>) -> MuxSubstream {
        MuxSubstream {
            stream_id,
            core: Arc::clone(self),
            out: PollSender::new(self.out_tx.clone()),
            data_rx,
            read_buf: Bytes::new(),
            wrote_fin: false,
        }
    }

    /// Open a substream toward the peer.
    pub async fn open(self: &Arc<Self>) -> Result<MuxSubstream, TransportError> {
        let stream_id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let data_rx = self.register(stream_id);
        self.out_tx
            .send(MuxFrame { stream_id, flags: FLAG_SYN, payload: Bytes::new() })
            .await
            .map_err(|_| TransportError::retryable("mux session closed"))?;
        Ok(self.substream(stream_id, data_rx))
    }

    /// Wait for the peer to open a substream.
    pub async fn accept(self: &Arc<Self>) -> Result<MuxSubstream, TransportError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::retryable("mux session closed"))
    }

    /// Feed one frame received from the wire. Backpressure propagates: a
    /// full per-stream queue stalls the whole pipe, which is what a single
    /// shared socket gives us anyway.
    pub async fn handle_incoming(self: &Arc<Self>, frame: MuxFrame) {
        if frame.flags & FLAG_SYN != 0 {
            let data_rx = self.register(frame.stream_id);
            let sub = self.substream(frame.stream_id, data_rx);
            if self.accept_tx.send(sub).await.is_err() {
                self.streams.lock().remove(&frame.stream_id);
            }
            return;
        }
        if frame.flags & (FLAG_FIN | FLAG_RST) != 0 {
            // Dropping the sender delivers EOF once buffered data drains.
            self.streams.lock().remove(&frame.stream_id);
            if frame.flags & FLAG_RST != 0 {
                return;
            }
        }
        if !frame.payload.is_empty() {
            let sender = self.streams.lock().get(&frame.stream_id).cloned();
            if let Some(sender) = sender {
                let _ = sender.send(frame.payload).await;
            }
        }
    }

    /// Tear down every stream (session closed underneath us).
    pub fn reset_all(&self) {
        self.streams.lock().clear();
    }
}

/// One logical substream over the mux.
pub struct MuxSubstream {
    stream_id: u32,
    core: Arc<MuxCore>,
    out: PollSender<MuxFrame>,
    data_rx: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
    wrote_fin: bool,
}

impl AsyncRead for MuxSubstream {
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
            match ready!(self.data_rx.poll_recv(cx)) {
                Some(chunk) => self.read_buf = chunk,
                // Peer sent FIN or RST (or the session died): EOF.
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for MuxSubstream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        ready!(self.out.poll_reserve(cx)).map_err(closed_err)?;
        let n = buf.len().min(MAX_CHUNK);
        let frame = MuxFrame {
            stream_id: self.stream_id,
            flags: 0,
            payload: Bytes::copy_from_slice(&buf[..n]),
        };
        self.out.send_item(frame).map_err(closed_err)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.wrote_fin {
            return Poll::Ready(Ok(()));
        }
        ready!(self.out.poll_reserve(cx)).map_err(closed_err)?;
        let frame = MuxFrame {
            stream_id: self.stream_id,
            flags: FLAG_FIN,
            payload: Bytes::new(),
        };
        self.out.send_item(frame).map_err(closed_err)?;
        self.wrote_fin = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxSubstream {
    fn drop(&mut self) {
        if !self.wrote_fin {
            // Best effort abort so the peer does not hang on reads.
            let _ = self.core.out_tx.try_send(MuxFrame {
                stream_id: self.stream_id,
                flags: FLAG_RST,
                payload: Bytes::new(),
            });
        }
    }
}

fn closed_err<E>(_: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mux session closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Wire the two cores back to back, as the WS pump would over a socket.
    fn bridged() -> (Arc<MuxCore>, Arc<MuxCore>) {
        let (a, mut a_out) = MuxCore::new(true);
        let (b, mut b_out) = MuxCore::new(false);
        let (a2, b2) = (Arc::clone(&a), Arc::clone(&b));
        tokio::spawn(async move {
            while let Some(frame) = a_out.recv().await {
                b2.handle_incoming(frame).await;
            }
        });
        tokio::spawn(async move {
            while let Some(frame) = b_out.recv().await {
                a2.handle_incoming(frame).await;
            }
        });
        (a, b)
    }

    #[test]
    fn test_frame_codec() {
        let frame = MuxFrame {
            stream_id: 0xDEAD,
            flags: FLAG_SYN,
            payload: Bytes::from_static(b"hi"),
        };
        let decoded = MuxFrame::decode(&frame.encode()).unwrap();
        assert_eq!(frame, decoded);
        assert!(MuxFrame::decode(&[0, 1, 2]).is_err());
    }

    #[tokio::test]
    async fn test_open_accept_exchange() {
        let (a, b) = bridged();
        let mut opened = a.open().await.unwrap();
        let mut accepted = b.accept().await.unwrap();

        opened.write_all(b"over the loom").await.unwrap();
        let mut buf = [0u8; 13];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the loom");

        accepted.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        opened.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }

    #[tokio::test]
    async fn test_fin_delivers_eof() {
        let (a, b) = bridged();
        let mut opened = a.open().await.unwrap();
        let mut accepted = b.accept().await.unwrap();

        opened.write_all(b"last").await.unwrap();
        opened.shutdown().await.unwrap();

        let mut out = Vec::new();
        accepted.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"last");
    }

    #[tokio::test]
    async fn test_id_parity_no_collision() {
        let (a, b) = bridged();
        let s1 = a.open().await.unwrap();
        let s2 = b.open().await.unwrap();
        let s3 = a.open().await.unwrap();
        assert_eq!(s1.stream_id % 2, 1);
        assert_eq!(s2.stream_id % 2, 0);
        assert_ne!(s1.stream_id, s3.stream_id);
    }
}
