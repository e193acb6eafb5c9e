//! End-to-end stream encryption
//!
//! Streams whose endpoints are separated by one or more transit hops wrap
//! every payload chunk in ChaCha20-Poly1305 under keys derived from the
//! ephemeral X25519 exchange in STREAM_OPEN / STREAM_OPEN_ACK. Chunks are
//! framed `{u32 length, ciphertext || tag}`; the nonce folds in a strictly
//! increasing per-direction counter, so a replayed, reordered or tampered
//! chunk fails authentication and kills the stream.
//!
//! Transit nodes splice the framed ciphertext through without touching it.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{derive_stream_keys, DirectionKey, TAG_LEN};
use crate::transport::BoxedSubstream;
use crate::WeftError;

/// Plaintext per chunk; keeps frames comfortably under the frame cap.
const MAX_PLAIN: usize = 16 * 1024;
/// Ciphertext cap accepted from the wire.
const MAX_CIPHER: usize = MAX_PLAIN + TAG_LEN;

/// An end-to-end encrypted stream over a transport substream.
pub struct E2eStream {
    inner: BoxedSubstream,
    send_key: DirectionKey,
    recv_key: DirectionKey,
    send_counter: u64,
    recv_counter: u64,

    // Read side.
    header: [u8; 4],
    header_filled: usize,
    cipher_buf: BytesMut,
    cipher_expected: usize,
    plain_buf: Bytes,

    // Write side: one encrypted frame awaiting the wire.
    pending: BytesMut,
}

impl E2eStream {
    /// Wrap `inner` with keys derived from the X25519 shared secret.
    /// `is_opener` fixes which direction label each side sends under.
    pub fn new(
        inner: BoxedSubstream,
        shared_secret: &[u8; 32],
        is_opener: bool,
    ) -> Result<Self, WeftError> {
        let (send_key, recv_key) = derive_stream_keys(shared_secret, is_opener)?;
        Ok(Self {
            inner,
            send_key,
            recv_key,
            send_counter: 0,
            recv_counter: 0,
            header: [0u8; 4],
            header_filled: 0,
            cipher_buf: BytesMut::new(),
            cipher_expected: 0,
            plain_buf: Bytes::new(),
            pending: BytesMut::new(),
        })
    }

    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

fn integrity_err() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "integrity")
}

impl AsyncRead for E2eStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.plain_buf.is_empty() {
                let n = this.plain_buf.len().min(buf.remaining());
                buf.put_slice(&this.plain_buf[..n]);
                this.plain_buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.header_filled < 4 {
                let mut tmp = [0u8; 4];
                let mut read_buf = ReadBuf::new(&mut tmp[..4 - this.header_filled]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
                let got = read_buf.filled().len();
                if got == 0 {
                    // EOF mid-header is only clean at a chunk boundary.
                    if this.header_filled == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()));
                }
                let offset = this.header_filled;
                this.header[offset..offset + got].copy_from_slice(read_buf.filled());
                this.header_filled += got;
                if this.header_filled < 4 {
                    continue;
                }
                let len = u32::from_be_bytes(this.header) as usize;
                if len < TAG_LEN || len > MAX_CIPHER {
                    return Poll::Ready(Err(integrity_err()));
                }
                this.cipher_expected = len;
                this.cipher_buf.clear();
                this.cipher_buf.reserve(len);
            }

            while this.cipher_buf.len() < this.cipher_expected {
                let missing = this.cipher_expected - this.cipher_buf.len();
                let mut tmp = vec![0u8; missing];
                let mut read_buf = ReadBuf::new(&mut tmp);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
                let got = read_buf.filled().len();
                if got == 0 {
                    return Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()));
                }
                this.cipher_buf.put_slice(read_buf.filled());
            }

            let plain = this
                .recv_key
                .open_chunk(this.recv_counter, &this.cipher_buf)
                .map_err(|_| integrity_err())?;
            this.recv_counter += 1;
            this.header_filled = 0;
            this.plain_buf = Bytes::from(plain);
        }
    }
}

impl AsyncWrite for E2eStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        ready!(this.poll_flush_pending(cx))?;

        let n = buf.len().min(MAX_PLAIN);
        let cipher = this
            .send_key
            .seal_chunk(this.send_counter, &buf[..n])
            .map_err(|_| integrity_err())?;
        this.send_counter += 1;
        this.pending.put_u32(cipher.len() as u32);
        this.pending.put_slice(&cipher);

        // The frame is buffered; it drains on the next write, flush, or
        // shutdown.
        let _ = this.poll_flush_pending(cx)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use x25519_dalek::{PublicKey, StaticSecret};

    fn shared() -> [u8; 32] {
        let a = StaticSecret::random_from_rng(rand::thread_rng());
        let b = StaticSecret::random_from_rng(rand::thread_rng());
        *a.diffie_hellman(&PublicKey::from(&b)).as_bytes()
    }

    fn encrypted_pair(secret: [u8; 32]) -> (E2eStream, E2eStream) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let opener = E2eStream::new(Box::new(a), &secret, true).unwrap();
        let terminator = E2eStream::new(Box::new(b), &secret, false).unwrap();
        (opener, terminator)
    }

    #[tokio::test]
    async fn test_bidirectional_roundtrip() {
        let (mut opener, mut terminator) = encrypted_pair(shared());

        opener.write_all(b"request bytes").await.unwrap();
        opener.flush().await.unwrap();
        let mut buf = [0u8; 13];
        terminator.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request bytes");

        terminator.write_all(b"response").await.unwrap();
        terminator.flush().await.unwrap();
        let mut buf = [0u8; 8];
        opener.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");
    }

    #[tokio::test]
    async fn test_large_transfer_chunks() {
        let (mut opener, mut terminator) = encrypted_pair(shared());
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            opener.write_all(&payload).await.unwrap();
            opener.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        terminator.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_clean_eof_at_chunk_boundary() {
        let (mut opener, mut terminator) = encrypted_pair(shared());
        opener.write_all(b"bye").await.unwrap();
        opener.shutdown().await.unwrap();

        let mut out = Vec::new();
        terminator.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bye");
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_integrity() {
        let secret = shared();

        // Play the middle hop: capture the framed chunk, flip a ciphertext
        // byte, feed it onward.
        let (a, mut wire) = tokio::io::duplex(64 * 1024);
        let mut opener = E2eStream::new(Box::new(a), &secret, true).unwrap();
        opener.write_all(b"sensitive").await.unwrap();
        opener.flush().await.unwrap();
        drop(opener);

        let mut raw = Vec::new();
        wire.read_to_end(&mut raw).await.unwrap();
        raw[6] ^= 0x01;

        let (mut inject, clean) = tokio::io::duplex(64 * 1024);
        inject.write_all(&raw).await.unwrap();
        drop(inject);

        let mut terminator = E2eStream::new(Box::new(clean), &secret, false).unwrap();
        let mut out = Vec::new();
        let err = terminator.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_roles_fail() {
        // Both sides claiming opener: directions collide, nothing decrypts.
        let secret = shared();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut x = E2eStream::new(Box::new(a), &secret, true).unwrap();
        let mut y = E2eStream::new(Box::new(b), &secret, true).unwrap();

        x.write_all(b"hello").await.unwrap();
        x.flush().await.unwrap();
        let mut buf = [0u8; 5];
        assert!(y.read_exact(&mut buf).await.is_err());
    }
}
