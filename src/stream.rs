//! Logical stream accounting and splicing
//!
//! The stream manager enforces the per-peer, global and pending-open limits,
//! allocates local stream IDs, and keeps byte counters per stream for the
//! observer surface. Splicing moves bytes between two pipes with proper
//! half-close semantics: EOF on one side shuts down the write half of the
//! other, and the pair ends when both directions are done.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::LimitsConfig;
use crate::identity::AgentId;
use crate::proto::{StreamKind, WireCode};

/// Shared per-stream record.
pub struct StreamInfo {
    pub local_id: u64,
    pub peer: AgentId,
    pub kind: StreamKind,
    pub destination: String,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    /// Fired by CTRL_STREAM_CLOSE or session teardown; splice tasks select
    /// on it.
    pub cancel: tokio_util::sync::CancellationToken,
}

/// Serializable stream view for the observer surface.
#[derive(Debug, Clone, Serialize)]
pub struct StreamView {
    pub local_id: u64,
    pub peer: AgentId,
    pub kind: StreamKind,
    pub destination: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub struct StreamManager {
    limits: LimitsConfig,
    next_id: AtomicU64,
    pending_opens: AtomicUsize,
    total: AtomicUsize,
    per_peer: Mutex<HashMap<AgentId, usize>>,
    table: Mutex<HashMap<(AgentId, u64), Arc<StreamInfo>>>,
}

impl StreamManager {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            next_id: AtomicU64::new(1),
            pending_opens: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            per_peer: Mutex::new(HashMap::new()),
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// 63-bit monotonic local stream ID.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) & (u64::MAX >> 1)
    }

    /// Reserve a pending-open slot; the guard releases it on drop. Returns
    /// the wire code to fail a STREAM_OPEN with when a limit is hit.
    pub fn begin_open(self: &Arc<Self>, peer: AgentId) -> Result<PendingOpen, WireCode> {
        if self.total.load(Ordering::Relaxed) >= self.limits.max_streams_total {
            return Err(WireCode::TooManyStreams);
        }
        if self
            .per_peer
            .lock()
            .get(&peer)
            .copied()
            .unwrap_or(0)
            >= self.limits.max_streams_per_peer
        {
            return Err(WireCode::TooManyStreams);
        }
        let pending = self.pending_opens.fetch_add(1, Ordering::Relaxed);
        if pending >= self.limits.max_pending_opens {
            self.pending_opens.fetch_sub(1, Ordering::Relaxed);
            return Err(WireCode::TooManyStreams);
        }
        Ok(PendingOpen { manager: Arc::clone(self) })
    }

    /// Install an established stream. Consumes the pending reservation.
    pub fn register(
        self: &Arc<Self>,
        pending: PendingOpen,
        local_id: u64,
        peer: AgentId,
        kind: StreamKind,
        destination: String,
    ) -> StreamHandle {
        drop(pending);
        let info = Arc::new(StreamInfo {
            local_id,
            peer,
            kind,
            destination,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            cancel: tokio_util::sync::CancellationToken::new(),
        });
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.per_peer.lock().entry(peer).or_insert(0) += 1;
        self.table.lock().insert((peer, local_id), Arc::clone(&info));
        StreamHandle { manager: Arc::clone(self), info }
    }

    fn unregister(&self, peer: AgentId, local_id: u64) {
        if self.table.lock().remove(&(peer, local_id)).is_some() {
            self.total.fetch_sub(1, Ordering::Relaxed);
            let mut per_peer = self.per_peer.lock();
            if let Some(count) = per_peer.get_mut(&peer) {
                *count -= 1;
                if *count == 0 {
                    per_peer.remove(&peer);
                }
            }
        }
    }

    /// Cancel a stream named by the peer that owns the other end. `local_id`
    /// is our numbering, which the peer learned from the open exchange.
    pub fn cancel(&self, peer: AgentId, local_id: u64) -> bool {
        if let Some(info) = self.table.lock().get(&(peer, local_id)) {
            info.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// Cancel every stream riding a torn-down peer session.
    pub fn cancel_peer(&self, peer: AgentId) {
        for ((owner, _), info) in self.table.lock().iter() {
            if *owner == peer {
                info.cancel.cancel();
            }
        }
    }

    pub fn active_total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn active_for_peer(&self, peer: AgentId) -> usize {
        self.per_peer.lock().get(&peer).copied().unwrap_or(0)
    }

    pub fn views(&self) -> Vec<StreamView> {
        self.table
            .lock()
            .values()
            .map(|info| StreamView {
                local_id: info.local_id,
                peer: info.peer,
                kind: info.kind,
                destination: info.destination.clone(),
                bytes_in: info.bytes_in.load(Ordering::Relaxed),
                bytes_out: info.bytes_out.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// A reserved pending-open slot.
pub struct PendingOpen {
    manager: Arc<StreamManager>,
}

impl Drop for PendingOpen {
    fn drop(&mut self) {
        self.manager.pending_opens.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Keeps a stream registered while alive; unregisters on drop.
pub struct StreamHandle {
    manager: Arc<StreamManager>,
    pub info: Arc<StreamInfo>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.manager.unregister(self.info.peer, self.info.local_id);
    }
}

/// Copy bytes both ways between `a` and `b` until both directions finish.
///
/// EOF on one read half shuts down the opposite write half, preserving
/// half-close: the other direction keeps flowing until it reaches its own
/// EOF. Byte counts are (a_to_b, b_to_a). Buffers are bounded by
/// `buffer_size`; no queueing beyond one chunk per direction.
pub async fn splice<A, B>(a: A, b: B, buffer_size: usize) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let forward = copy_then_shutdown(&mut a_read, &mut b_write, buffer_size);
    let backward = copy_then_shutdown(&mut b_read, &mut a_write, buffer_size);
    tokio::try_join!(forward, backward)
}

async fn copy_then_shutdown<R, W>(
    read: &mut R,
    write: &mut W,
    buffer_size: usize,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;
    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                // Propagate after closing our write half so the peer
                // observes EOF instead of hanging.
                let _ = write.shutdown().await;
                return Err(e);
            }
        };
        write.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
    write.flush().await?;
    write.shutdown().await?;
    Ok(copied)
}

/// Splice variant that feeds per-direction byte counters.
pub async fn splice_counted<A, B>(
    a: A,
    b: B,
    buffer_size: usize,
    info: &StreamInfo,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let result = splice(a, b, buffer_size).await;
    if let Ok((sent, received)) = &result {
        info.bytes_out.fetch_add(*sent, Ordering::Relaxed);
        info.bytes_in.fetch_add(*received, Ordering::Relaxed);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(limits: LimitsConfig) -> Arc<StreamManager> {
        Arc::new(StreamManager::new(limits))
    }

    #[test]
    fn test_limits_enforced() {
        let limits = LimitsConfig {
            max_streams_per_peer: 1,
            max_streams_total: 2,
            max_pending_opens: 8,
            ..Default::default()
        };
        let manager = manager_with(limits);
        let peer_a = AgentId([1; 16]);
        let peer_b = AgentId([2; 16]);

        let open = manager.begin_open(peer_a).unwrap();
        let _h1 = manager.register(open, 1, peer_a, StreamKind::Data, "x:1".into());

        // Per-peer limit.
        assert!(matches!(manager.begin_open(peer_a), Err(WireCode::TooManyStreams)));

        let open = manager.begin_open(peer_b).unwrap();
        let _h2 = manager.register(open, 2, peer_b, StreamKind::Data, "y:1".into());

        // Global limit.
        assert!(matches!(manager.begin_open(AgentId([3; 16])), Err(WireCode::TooManyStreams)));
    }

    #[test]
    fn test_pending_open_limit_and_release() {
        let limits = LimitsConfig {
            max_pending_opens: 1,
            ..Default::default()
        };
        let manager = manager_with(limits);
        let peer = AgentId([1; 16]);

        let pending = manager.begin_open(peer).unwrap();
        assert!(manager.begin_open(peer).is_err());
        drop(pending);
        assert!(manager.begin_open(peer).is_ok());
    }

    #[test]
    fn test_handle_drop_unregisters() {
        let manager = manager_with(LimitsConfig::default());
        let peer = AgentId([1; 16]);
        let open = manager.begin_open(peer).unwrap();
        let handle = manager.register(open, 7, peer, StreamKind::Data, "z:1".into());
        assert_eq!(manager.active_total(), 1);
        assert_eq!(manager.active_for_peer(peer), 1);
        drop(handle);
        assert_eq!(manager.active_total(), 0);
        assert_eq!(manager.active_for_peer(peer), 0);
    }

    #[tokio::test]
    async fn test_splice_both_directions() {
        let (a_near, a_far) = tokio::io::duplex(1024);
        let (b_near, b_far) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(a_far, b_far, 4096));

        let (mut a, mut b) = (a_near, b_near);
        a.write_all(b"question").await.unwrap();
        a.shutdown().await.unwrap();

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"question");

        b.write_all(b"answer").await.unwrap();
        b.shutdown().await.unwrap();

        let mut reply = Vec::new();
        a.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"answer");

        let (fwd, back) = task.await.unwrap().unwrap();
        assert_eq!(fwd, 8);
        assert_eq!(back, 6);
    }

    #[tokio::test]
    async fn test_splice_half_close_ordering() {
        let (a_near, a_far) = tokio::io::duplex(1024);
        let (b_near, b_far) = tokio::io::duplex(1024);
        let task = tokio::spawn(splice(a_far, b_far, 4096));

        let (mut a, mut b) = (a_near, b_near);
        // A closes its write half; B must see all bytes then EOF, and still
        // be able to write back.
        a.write_all(b"tail data").await.unwrap();
        a.shutdown().await.unwrap();

        let mut got = Vec::new();
        b.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"tail data");

        b.write_all(b"late reply").await.unwrap();
        b.shutdown().await.unwrap();
        let mut reply = Vec::new();
        a.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"late reply");

        task.await.unwrap().unwrap();
    }
}
