//! One live peer link
//!
//! Wraps an authenticated transport session: owns the control substream,
//! runs the keepalive/RTT loop, accepts incoming substreams, and opens
//! outbound logical streams with the STREAM_OPEN handshake and optional
//! end-to-end encryption.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use x25519_dalek::EphemeralSecret;

use crate::config::ConnectionsConfig;
use crate::e2e::E2eStream;
use crate::identity::AgentId;
use crate::proto::{
    read_frame, write_frame, Destination, Frame, PeerHello, StreamKind, StreamOpen,
    StreamOpenAck, WireCode, FLAG_E2E_SKIP,
};
use crate::stream::{StreamHandle, StreamManager};
use crate::transport::{BoxedSubstream, Session, TransportKind};
use crate::WeftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Dialer,
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Handshaking,
    Established,
    Unresponsive,
    Closing,
    Closed,
}

/// Upcalls from a session to the agent core.
pub enum PeerEvent {
    /// A control frame other than keepalives, which the session handles
    /// itself.
    Control(Arc<PeerSession>, Frame),
    /// The peer opened a substream; the first frame on it is STREAM_OPEN.
    Substream(Arc<PeerSession>, BoxedSubstream),
    Closed(Arc<PeerSession>),
}

pub struct PeerSession {
    pub remote_id: AgentId,
    pub remote_name: String,
    /// Remote static X25519 key from the hello.
    pub remote_public: [u8; 32],
    pub direction: Direction,
    transport: Arc<dyn Session>,
    control_tx: mpsc::Sender<Frame>,
    state: RwLock<SessionState>,
    rtt: Mutex<Option<Duration>>,
    last_activity: Mutex<Instant>,
    outstanding_keepalives: Mutex<HashMap<u64, Instant>>,
    cancel: CancellationToken,
}

impl PeerSession {
    /// Take ownership of an authenticated transport session and spin up its
    /// tasks. `control` is the substream the handshake ran on.
    pub fn start(
        transport: Arc<dyn Session>,
        control: BoxedSubstream,
        remote: &PeerHello,
        direction: Direction,
        connections: &ConnectionsConfig,
        events: mpsc::Sender<PeerEvent>,
    ) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::channel(64);
        let session = Arc::new(Self {
            remote_id: remote.agent_id,
            remote_name: remote.display_name.clone(),
            remote_public: remote.x25519_public,
            direction,
            transport,
            control_tx,
            state: RwLock::new(SessionState::Established),
            rtt: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            outstanding_keepalives: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        let (control_read, control_write) = tokio::io::split(control);
        tokio::spawn(Self::control_write_loop(
            Arc::clone(&session),
            control_write,
            control_rx,
        ));
        tokio::spawn(Self::control_read_loop(
            Arc::clone(&session),
            control_read,
            events.clone(),
        ));
        tokio::spawn(Self::keepalive_loop(Arc::clone(&session), connections.clone()));
        tokio::spawn(Self::accept_loop(Arc::clone(&session), events.clone()));
        tokio::spawn(Self::close_watch(Arc::clone(&session), events));
        session
    }

    async fn control_write_loop(
        session: Arc<Self>,
        mut write: tokio::io::WriteHalf<BoxedSubstream>,
        mut control_rx: mpsc::Receiver<Frame>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = session.cancel.cancelled() => break,
                frame = control_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = write_frame(&mut write, &frame).await {
                log::debug!(
                    "[PEER] {} control write failed: {}",
                    session.remote_id.short(),
                    e
                );
                break;
            }
        }
        let _ = write.shutdown().await;
        session.cancel.cancel();
    }

    async fn control_read_loop(
        session: Arc<Self>,
        mut read: tokio::io::ReadHalf<BoxedSubstream>,
        events: mpsc::Sender<PeerEvent>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = session.cancel.cancelled() => break,
                frame = read_frame(&mut read) => frame,
            };
            session.touch();
            match frame {
                Ok(Some(Frame::Keepalive { nonce, .. })) => {
                    let _ = session.control_tx.send(Frame::KeepaliveAck { nonce }).await;
                }
                Ok(Some(Frame::KeepaliveAck { nonce })) => {
                    session.record_keepalive_ack(nonce);
                }
                Ok(Some(frame)) => {
                    if events
                        .send(PeerEvent::Control(Arc::clone(&session), frame))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                // Unknown frame types stay forward-compatible.
                Err(WeftError::UnknownFrame(t)) => {
                    log::debug!(
                        "[PEER] {} sent unknown control frame {:#04x}, ignoring",
                        session.remote_id.short(),
                        t
                    );
                }
                Err(e) => {
                    log::debug!(
                        "[PEER] {} control read failed: {}",
                        session.remote_id.short(),
                        e
                    );
                    break;
                }
                Ok(None) => break,
            }
        }
        session.cancel.cancel();
    }

    async fn keepalive_loop(session: Arc<Self>, connections: ConnectionsConfig) {
        let mut nonce: u64 = rand::thread_rng().gen();
        loop {
            let jitter = connections.keepalive_jitter;
            let factor = if jitter > 0.0 {
                1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
            } else {
                1.0
            };
            let interval = connections.keepalive_interval.mul_f64(factor.max(0.0));
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            // A previous probe still unanswered past the timeout means the
            // peer is unresponsive.
            let now = Instant::now();
            let stale = session
                .outstanding_keepalives
                .lock()
                .values()
                .any(|sent| now.duration_since(*sent) > connections.keepalive_timeout);
            if stale {
                log::warn!(
                    "[PEER] {} unresponsive (no keepalive ack within {:?})",
                    session.remote_id.short(),
                    connections.keepalive_timeout
                );
                *session.state.write() = SessionState::Unresponsive;
                session.cancel.cancel();
                return;
            }

            nonce = nonce.wrapping_add(1);
            session
                .outstanding_keepalives
                .lock()
                .insert(nonce, Instant::now());
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            if session
                .control_tx
                .send(Frame::Keepalive { nonce, timestamp })
                .await
                .is_err()
            {
                return;
            }
        }
    }

    async fn accept_loop(session: Arc<Self>, events: mpsc::Sender<PeerEvent>) {
        loop {
            let substream = tokio::select! {
                _ = session.cancel.cancelled() => break,
                substream = session.transport.accept_substream() => substream,
            };
            match substream {
                Ok(substream) => {
                    session.touch();
                    if events
                        .send(PeerEvent::Substream(Arc::clone(&session), substream))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!(
                        "[PEER] {} accept ended: {}",
                        session.remote_id.short(),
                        e
                    );
                    break;
                }
            }
        }
        session.cancel.cancel();
    }

    async fn close_watch(session: Arc<Self>, events: mpsc::Sender<PeerEvent>) {
        session.cancel.cancelled().await;
        {
            let mut state = session.state.write();
            if *state != SessionState::Unresponsive {
                *state = SessionState::Closed;
            }
        }
        session.transport.close(0, "session closed").await;
        let _ = events.send(PeerEvent::Closed(session.clone())).await;
    }

    fn record_keepalive_ack(&self, nonce: u64) {
        if let Some(sent) = self.outstanding_keepalives.lock().remove(&nonce) {
            let sample = sent.elapsed();
            let mut rtt = self.rtt.lock();
            *rtt = Some(match *rtt {
                // SRTT-style smoothing: 7/8 history, 1/8 sample.
                Some(current) => current.mul_f64(0.875) + sample.mul_f64(0.125),
                None => sample,
            });
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Queue a control frame for the peer.
    pub async fn send_control(&self, frame: Frame) -> Result<(), WeftError> {
        self.control_tx
            .send(frame)
            .await
            .map_err(|_| WeftError::PeerGone(self.remote_id))
    }

    /// Open a logical stream toward this peer. When `e2e` is set, a fresh
    /// ephemeral key rides the STREAM_OPEN and the returned substream
    /// encrypts end to end; otherwise the single-hop skip flag is sent.
    pub async fn open_stream(
        self: &Arc<Self>,
        streams: &Arc<StreamManager>,
        kind: StreamKind,
        destination: Destination,
        e2e: bool,
        tail: Vec<u8>,
    ) -> Result<(BoxedSubstream, StreamHandle), WeftError> {
        let pending = streams.begin_open(self.remote_id).map_err(WeftError::Wire)?;
        let mut substream = self.transport.open_substream().await?;
        let request_id = streams.allocate_id();

        let ephemeral = if e2e {
            Some(EphemeralSecret::random_from_rng(rand::thread_rng()))
        } else {
            None
        };
        let e2e_public = ephemeral
            .as_ref()
            .map(|secret| *x25519_dalek::PublicKey::from(secret).as_bytes())
            .unwrap_or([0u8; 32]);

        let open = StreamOpen {
            kind,
            destination: destination.clone(),
            e2e_public,
            flags: if e2e { 0 } else { FLAG_E2E_SKIP },
            request_id,
            tail,
        };
        write_frame(&mut substream, &Frame::StreamOpen(open)).await?;

        let ack = tokio::time::timeout(
            streams.limits().stream_open_timeout,
            read_frame(&mut substream),
        )
        .await
        .map_err(|_| WeftError::Wire(WireCode::Timeout))??;
        let ack = match ack {
            Some(Frame::StreamOpenAck(ack)) => ack,
            Some(_) => return Err(WeftError::Protocol("expected stream open ack".into())),
            None => return Err(WeftError::Wire(WireCode::DialFailed)),
        };
        if ack.status != WireCode::Ok {
            return Err(WeftError::Wire(ack.status));
        }

        let substream: BoxedSubstream = match ephemeral {
            Some(secret) => {
                let remote = x25519_dalek::PublicKey::from(ack.e2e_public);
                let shared = secret.diffie_hellman(&remote);
                Box::new(E2eStream::new(substream, shared.as_bytes(), true)?)
            }
            None => substream,
        };

        self.touch();
        let handle = streams.register(
            pending,
            request_id,
            self.remote_id,
            kind,
            destination.to_string(),
        );
        log::debug!(
            "[PEER] {} opened {} stream {} to {}",
            self.remote_id.short(),
            kind,
            request_id,
            destination
        );
        Ok((substream, handle))
    }

    /// Open a bare transport substream; transit forwarding writes its own
    /// STREAM_OPEN so the opener's key material passes through untouched.
    pub async fn open_raw_substream(&self) -> Result<BoxedSubstream, crate::transport::TransportError> {
        self.transport.open_substream().await
    }

    /// Answer an accepted STREAM_OPEN on its substream.
    pub async fn send_open_ack(
        substream: &mut BoxedSubstream,
        request_id: u64,
        stream_id: u64,
        status: WireCode,
        e2e_public: [u8; 32],
    ) -> Result<(), WeftError> {
        write_frame(
            substream,
            &Frame::StreamOpenAck(StreamOpenAck {
                request_id,
                stream_id,
                status,
                e2e_public,
            }),
        )
        .await
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.lock().or_else(|| self.transport.transport_rtt())
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.remote_addr()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the session is torn down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Tear the session down; tasks notice via the token and the close
    /// watcher emits `PeerEvent::Closed` exactly once.
    pub fn shutdown(&self) {
        *self.state.write() = SessionState::Closing;
        self.cancel.cancel();
    }
}
