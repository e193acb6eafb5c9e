//! Agent composition: roles, supervisors, control plane, observer surface
//!
//! `Agent` wires the pieces together: the session manager and its dial and
//! accept supervisors, the routing and node-info floods on their timers, the
//! SOCKS5 and forward ingress loops, and the sleep/wake state machine. The
//! observer methods on [`Core`] are the contract the HTTP layer consumes;
//! they are stateless with respect to the core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ListenerConfig, PeerConfig};
use crate::exit::ExitEndpoint;
use crate::identity::{AgentId, Identity};
use crate::nodeinfo::{NodeDescriptor, NodeInfoStore, Role, SensitiveInfo};
use crate::peer::session::{Direction, PeerEvent, PeerSession};
use crate::peer::manager::{Admission, SessionManager};
use crate::peer::ReconnectPolicy;
use crate::proto::{Destination, Frame, StreamKind, WireCode};
use crate::routing::{RoutePrefix, RouteTable, RouteTarget, RouteView};
use crate::stream::{StreamHandle, StreamManager, StreamView};
use crate::transport::BoxedSubstream;
use crate::crypto::SignedCommand;
use crate::WeftError;

const MESH_TEST_CACHE: Duration = Duration::from_secs(30);
const MESH_TEST_TIMEOUT: Duration = Duration::from_secs(5);
/// How often a sleeping node pokes its peers to hear a WAKE.
const SLEEP_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// A non-data stream accepted for an external feature (shell, file, ping,
/// rpc). The embedding layer shuttles bytes between it and its own client.
pub struct IncomingFeature {
    pub from: AgentId,
    pub kind: StreamKind,
    pub params: Vec<u8>,
    pub stream: BoxedSubstream,
    pub handle: StreamHandle,
}

/// An opened path for client traffic.
pub enum MeshConn {
    /// Stream through the mesh (handle keeps it registered).
    Stream(BoxedSubstream, StreamHandle),
    /// This node is the exit: a directly dialed TCP socket.
    Direct(tokio::net::TcpStream),
    /// This node is the exit for a UDP association.
    DirectUdp(tokio::net::UdpSocket),
}

impl std::fmt::Debug for MeshConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshConn::Stream(_, _) => write!(f, "Stream"),
            MeshConn::Direct(s) => f.debug_tuple("Direct").field(s).finish(),
            MeshConn::DirectUdp(s) => f.debug_tuple("DirectUdp").field(s).finish(),
        }
    }
}

/// Read-only status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub agent_id: AgentId,
    pub short_id: String,
    pub display_name: String,
    pub peers: usize,
    pub streams: usize,
    pub routes: usize,
    pub known_agents: usize,
    pub socks5_enabled: bool,
    pub exit_enabled: bool,
    pub sleeping: bool,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    pub id: AgentId,
    pub display_name: String,
    pub transport: crate::transport::TransportKind,
    pub address: Option<String>,
    pub direction: Direction,
    pub state: crate::peer::SessionState,
    pub rtt_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub agent: AgentId,
    pub ok: bool,
    pub rtt_ms: Option<u64>,
    pub error: Option<String>,
}

/// Shared agent state and the observer contract.
pub struct Core {
    pub identity: Identity,
    pub config: Config,
    pub routes: Arc<RouteTable>,
    pub nodes: Arc<NodeInfoStore>,
    pub streams: Arc<StreamManager>,
    pub sessions: Arc<SessionManager>,
    pub exit: Option<ExitEndpoint>,

    management_public: Option<x25519_dalek::PublicKey>,
    management_secret: Option<x25519_dalek::StaticSecret>,
    signing_public: Option<ed25519_dalek::VerifyingKey>,

    events_tx: mpsc::Sender<PeerEvent>,
    feature_tx: mpsc::Sender<IncomingFeature>,

    descriptor_version: AtomicU64,
    started_at: Instant,
    sleeping: AtomicBool,
    wake: Notify,
    advertise_nudge: Notify,
    associations: AtomicUsize,
    dynamic_forwards: parking_lot::RwLock<HashMap<String, String>>,
    mesh_cache: tokio::sync::Mutex<Option<(Instant, Vec<ProbeResult>)>>,
    cancel: CancellationToken,
}

impl Core {
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        for session in self.sessions.list() {
            session.shutdown();
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Relaxed)
    }

    pub fn try_acquire_association(&self) -> bool {
        let max = self.config.udp.max_associations;
        let previous = self.associations.fetch_add(1, Ordering::Relaxed);
        if previous >= max {
            self.associations.fetch_sub(1, Ordering::Relaxed);
            false
        } else {
            true
        }
    }

    pub fn release_association(&self) {
        self.associations.fetch_sub(1, Ordering::Relaxed);
    }

    /// Route lookup plus stream open for prefix-addressed traffic.
    pub async fn open_mesh_stream(
        self: &Arc<Self>,
        kind: StreamKind,
        destination: Destination,
        tail: Vec<u8>,
    ) -> Result<MeshConn, WeftError> {
        match self.routes.lookup_with_metric(&destination, None) {
            Some((RouteTarget::Local, _)) => {
                let exit = self
                    .exit
                    .as_ref()
                    .ok_or(WeftError::Wire(WireCode::NoRoute))?;
                match kind {
                    StreamKind::Udp => {
                        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
                        Ok(MeshConn::DirectUdp(socket))
                    }
                    _ => Ok(MeshConn::Direct(exit.dial(&destination).await?)),
                }
            }
            Some((RouteTarget::Peer(next), metric)) => {
                let session = self
                    .sessions
                    .get(&next)
                    .ok_or(WeftError::PeerGone(next))?;
                // One hop is already covered by transport TLS.
                let e2e = metric > 1;
                let (stream, handle) = session
                    .open_stream(&self.streams, kind, destination, e2e, tail)
                    .await?;
                Ok(MeshConn::Stream(stream, handle))
            }
            None => Err(WeftError::Wire(WireCode::NoRoute)),
        }
    }

    /// Next peer session on a path toward `agent`: the peer itself when
    /// direct, otherwise whoever flooded us its descriptor.
    pub fn next_hop_to_agent(&self, agent: AgentId) -> Option<Arc<PeerSession>> {
        if let Some(direct) = self.sessions.get(&agent) {
            return Some(direct);
        }
        self.nodes
            .via(&agent)
            .and_then(|via| self.sessions.get(&via))
    }

    /// Open an agent-addressed stream (forward and feature kinds).
    pub async fn open_agent_stream(
        self: &Arc<Self>,
        agent: AgentId,
        kind: StreamKind,
        tail: Vec<u8>,
    ) -> Result<(BoxedSubstream, StreamHandle), WeftError> {
        let session = self
            .next_hop_to_agent(agent)
            .ok_or(WeftError::PeerGone(agent))?;
        let direct = session.remote_id == agent;
        session
            .open_stream(
                &self.streams,
                kind,
                crate::relay::agent_destination(agent),
                !direct,
                tail,
            )
            .await
    }

    /// Forward exit target for a key this node terminates.
    pub fn forward_exit_target(&self, key: &str) -> Option<String> {
        if let Some(target) = self.dynamic_forwards.read().get(key) {
            return Some(target.clone());
        }
        self.config
            .forward
            .exits
            .iter()
            .find(|exit| exit.key == key)
            .map(|exit| exit.target.clone())
    }

    /// The agent terminating a forward key: ourselves, or one learned from
    /// node-info.
    pub fn find_forward_exit_agent(&self, key: &str) -> Option<AgentId> {
        if self.forward_exit_target(key).is_some() {
            return Some(self.identity.id);
        }
        self.nodes.forward_exit_for(key, self.management_secret.as_ref())
    }

    pub async fn deliver_feature(
        &self,
        from: AgentId,
        kind: StreamKind,
        params: Vec<u8>,
        stream: BoxedSubstream,
        handle: StreamHandle,
    ) {
        if self
            .feature_tx
            .send(IncomingFeature { from, kind, params, stream, handle })
            .await
            .is_err()
        {
            log::debug!("[AGENT] No feature consumer, dropping {} stream", kind);
        }
    }

    fn roles(&self) -> Vec<Role> {
        let mut roles = vec![Role::Transit];
        if self.config.socks5.enabled {
            roles.push(Role::Ingress);
        }
        if self.config.exit.enabled {
            roles.push(Role::Exit);
        }
        if !self.config.forward.listeners.is_empty() {
            roles.push(Role::ForwardIngress);
        }
        if !self.config.forward.exits.is_empty() || !self.dynamic_forwards.read().is_empty() {
            roles.push(Role::ForwardExit);
        }
        roles
    }

    /// Build (and version-bump) our descriptor for the next flood.
    pub fn build_descriptor(&self) -> Result<NodeDescriptor, WeftError> {
        let version = self.descriptor_version.fetch_add(1, Ordering::Relaxed) + 1;
        let sensitive = SensitiveInfo {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into()),
            os: std::env::consts::OS.into(),
            arch: std::env::consts::ARCH.into(),
            agent_version: env!("CARGO_PKG_VERSION").into(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            addresses: self
                .config
                .listeners
                .iter()
                .map(|listener| listener.address.to_string())
                .collect(),
            forward_listeners: self
                .config
                .forward
                .listeners
                .iter()
                .map(|listener| listener.key.clone())
                .collect(),
            forward_exits: {
                let mut keys: Vec<String> = self
                    .config
                    .forward
                    .exits
                    .iter()
                    .map(|exit| exit.key.clone())
                    .collect();
                keys.extend(self.dynamic_forwards.read().keys().cloned());
                keys
            },
            shell_available: false,
        };
        let descriptor = NodeDescriptor {
            agent_id: self.identity.id,
            display_name: self.identity.display_name.clone(),
            version,
            roles: self.roles(),
            exit_routes: self.routes.local_prefixes(),
            sensitive: Some(sensitive),
            sealed: None,
            path: Vec::new(),
        };
        match &self.management_public {
            Some(key) => descriptor.sealed_for(key),
            None => Ok(descriptor),
        }
    }

    fn require_operator(&self) -> Result<(), WeftError> {
        if self.management_public.is_some() && self.management_secret.is_none() {
            return Err(WeftError::Unauthorized(
                "management private key required".into(),
            ));
        }
        Ok(())
    }

    // ---- observer surface -------------------------------------------------

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            running: !self.cancel.is_cancelled(),
            agent_id: self.identity.id,
            short_id: self.identity.id.short(),
            display_name: self.identity.display_name.clone(),
            peers: self.sessions.len(),
            streams: self.streams.active_total(),
            routes: self.routes.len(),
            known_agents: self.nodes.len(),
            socks5_enabled: self.config.socks5.enabled,
            exit_enabled: self.config.exit.enabled,
            sleeping: self.is_sleeping(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn peers(&self) -> Vec<PeerView> {
        self.sessions
            .list()
            .into_iter()
            .map(|session| PeerView {
                id: session.remote_id,
                display_name: session.remote_name.clone(),
                transport: session.transport_kind(),
                address: session.remote_addr().map(|addr| addr.to_string()),
                direction: session.direction,
                state: session.state(),
                rtt_ms: session.rtt().map(|rtt| rtt.as_millis() as u64),
            })
            .collect()
    }

    pub fn routes_view(&self) -> Vec<RouteView> {
        self.routes.views(Instant::now())
    }

    pub fn streams_view(&self) -> Vec<StreamView> {
        self.streams.views()
    }

    pub fn dynamic_route_add(&self, cidr: &str) -> Result<(), WeftError> {
        self.require_operator()?;
        let net = cidr
            .parse()
            .map_err(|_| WeftError::Config(format!("bad cidr: {}", cidr)))?;
        self.routes.add_dynamic(RoutePrefix::Cidr(net));
        self.advertise_nudge.notify_one();
        Ok(())
    }

    pub fn dynamic_route_remove(&self, cidr: &str) -> Result<(), WeftError> {
        self.require_operator()?;
        let net = cidr
            .parse()
            .map_err(|_| WeftError::Config(format!("bad cidr: {}", cidr)))?;
        self.routes.remove_dynamic(&RoutePrefix::Cidr(net))?;
        self.advertise_nudge.notify_one();
        Ok(())
    }

    pub fn dynamic_route_list(&self) -> Vec<String> {
        self.routes
            .dynamic_routes()
            .into_iter()
            .map(|prefix| prefix.to_string())
            .collect()
    }

    pub fn dynamic_forward_add(&self, key: &str, target: &str) -> Result<(), WeftError> {
        self.require_operator()?;
        self.dynamic_forwards
            .write()
            .insert(key.to_string(), target.to_string());
        Ok(())
    }

    pub fn dynamic_forward_remove(&self, key: &str) -> Result<(), WeftError> {
        self.require_operator()?;
        self.dynamic_forwards
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| WeftError::NotFound(format!("no forward for key {:?}", key)))
    }

    pub fn dynamic_forward_list(&self) -> Vec<(String, String)> {
        self.dynamic_forwards
            .read()
            .iter()
            .map(|(key, target)| (key.clone(), target.clone()))
            .collect()
    }

    /// Force an advertise cycle ahead of the timer.
    pub fn advertise_now(&self) {
        self.advertise_nudge.notify_one();
    }

    /// Open a non-data stream (shell, ping, file, rpc) to an agent. The
    /// caller shuttles bytes between the returned stream and its client.
    pub async fn open_feature_stream(
        self: &Arc<Self>,
        agent: AgentId,
        kind: StreamKind,
        params: Vec<u8>,
    ) -> Result<(BoxedSubstream, StreamHandle), WeftError> {
        match kind {
            StreamKind::Shell | StreamKind::Icmp | StreamKind::File | StreamKind::Rpc => {
                self.open_agent_stream(agent, kind, params).await
            }
            _ => Err(WeftError::Protocol(format!("{} is not a feature kind", kind))),
        }
    }

    /// Probe every known agent with a short status stream. Results cache
    /// for 30 seconds.
    pub async fn mesh_test(self: &Arc<Self>) -> Vec<ProbeResult> {
        {
            let cache = self.mesh_cache.lock().await;
            if let Some((at, results)) = cache.as_ref() {
                if at.elapsed() < MESH_TEST_CACHE {
                    return results.clone();
                }
            }
        }

        let mut targets: Vec<AgentId> = self
            .sessions
            .list()
            .into_iter()
            .map(|session| session.remote_id)
            .collect();
        for agent in self.nodes.known_agents() {
            if !targets.contains(&agent) {
                targets.push(agent);
            }
        }

        let mut results = Vec::with_capacity(targets.len());
        for agent in targets {
            let started = Instant::now();
            let outcome = tokio::time::timeout(MESH_TEST_TIMEOUT, self.probe(agent)).await;
            results.push(match outcome {
                Ok(Ok(())) => ProbeResult {
                    agent,
                    ok: true,
                    rtt_ms: Some(started.elapsed().as_millis() as u64),
                    error: None,
                },
                Ok(Err(e)) => ProbeResult {
                    agent,
                    ok: false,
                    rtt_ms: None,
                    error: Some(e.to_string()),
                },
                Err(_) => ProbeResult {
                    agent,
                    ok: false,
                    rtt_ms: None,
                    error: Some("timeout".into()),
                },
            });
        }

        *self.mesh_cache.lock().await = Some((Instant::now(), results.clone()));
        results
    }

    async fn probe(self: &Arc<Self>, agent: AgentId) -> Result<(), WeftError> {
        use tokio::io::AsyncReadExt;
        let (mut stream, _handle) = self
            .open_agent_stream(agent, StreamKind::Rpc, b"probe".to_vec())
            .await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        if response.is_empty() {
            return Err(WeftError::Protocol("empty probe response".into()));
        }
        Ok(())
    }

    /// Join two in-process agents over the memory transport. Test meshes
    /// and embedded multi-agent setups use this instead of sockets.
    pub async fn connect_memory(a: &Arc<Core>, b: &Arc<Core>) -> Result<(), WeftError> {
        let (transport_a, transport_b) = crate::transport::memory::pair();
        let b_core = Arc::clone(b);
        let accept_side = tokio::spawn(async move {
            let transport_b: Arc<dyn crate::transport::Session> = transport_b;
            let mut control = transport_b.accept_substream().await?;
            let digest = b_core
                .build_descriptor()
                .map(|descriptor| descriptor.digest())
                .unwrap_or([0u8; 32]);
            let remote =
                crate::peer::handshake::accept(&mut control, &b_core.identity, digest).await?;
            let session = PeerSession::start(
                transport_b,
                control,
                &remote,
                Direction::Accepted,
                &b_core.config.connections,
                b_core.events_tx.clone(),
            );
            install_session(&b_core, session).await;
            Ok::<(), WeftError>(())
        });

        let transport_a: Arc<dyn crate::transport::Session> = transport_a;
        let mut control = transport_a.open_substream().await?;
        let digest = a
            .build_descriptor()
            .map(|descriptor| descriptor.digest())
            .unwrap_or([0u8; 32]);
        let remote = crate::peer::handshake::dial(&mut control, &a.identity, digest).await?;
        let session = PeerSession::start(
            transport_a,
            control,
            &remote,
            Direction::Dialer,
            &a.config.connections,
            a.events_tx.clone(),
        );
        install_session(a, session).await;

        accept_side
            .await
            .map_err(|e| WeftError::Protocol(format!("accept side panicked: {}", e)))??;
        Ok(())
    }

    /// Flood a signed sleep command and enter the low-traffic state.
    pub async fn send_sleep(&self) -> Result<(), WeftError> {
        let command = self.make_command("sleep")?;
        self.broadcast(Frame::Sleep(command)).await;
        self.enter_sleep().await;
        Ok(())
    }

    pub async fn send_wake(&self) -> Result<(), WeftError> {
        let command = self.make_command("wake")?;
        self.broadcast(Frame::Wake(command)).await;
        self.leave_sleep();
        Ok(())
    }

    fn make_command(&self, name: &str) -> Result<SignedCommand, WeftError> {
        match self.identity.signing_key() {
            Some(key) => Ok(SignedCommand::new_signed(name, self.identity.id, key)),
            None if self.signing_public.is_none() => {
                Ok(SignedCommand::new_unsigned(name, self.identity.id))
            }
            None => Err(WeftError::Unauthorized(
                "mesh requires signed commands and no signing key is configured".into(),
            )),
        }
    }

    async fn broadcast(&self, frame: Frame) {
        for session in self.sessions.list() {
            let _ = session.send_control(frame.clone()).await;
        }
    }

    async fn enter_sleep(&self) {
        if !self.sleeping.swap(true, Ordering::Relaxed) {
            log::info!("[AGENT] Entering sleep: closing sessions, ingress paused");
            // Let queued control frames (the sleep re-flood) reach the wire
            // before the links drop.
            tokio::time::sleep(Duration::from_millis(100)).await;
            for session in self.sessions.list() {
                session.shutdown();
            }
        }
    }

    fn leave_sleep(&self) {
        if self.sleeping.swap(false, Ordering::Relaxed) {
            log::info!("[AGENT] Waking up");
            self.wake.notify_waiters();
        }
    }
}

/// The running agent: owns the event loop end of the core.
pub struct Agent {
    core: Arc<Core>,
    events_rx: mpsc::Receiver<PeerEvent>,
    feature_rx: Option<mpsc::Receiver<IncomingFeature>>,
}

impl Agent {
    pub fn new(config: Config) -> Result<Self, WeftError> {
        config.validate()?;
        let mut identity =
            Identity::load_or_create(&config.agent.data_dir, &config.agent.display_name)?;
        if let Some(fixed) = config.agent.fixed_id()? {
            identity.id = fixed;
        }
        Self::with_identity(config, identity)
    }

    /// Assemble around a caller-provided identity; test meshes use this
    /// with ephemeral identities.
    pub fn with_identity(config: Config, identity: Identity) -> Result<Self, WeftError> {
        let routes = Arc::new(RouteTable::new(
            identity.id,
            config.routing.max_hops,
            config.routing.route_ttl,
        ));
        if config.exit.enabled {
            for prefix in config.exit_prefixes() {
                routes.add_local(prefix);
            }
        }
        let exit = if config.exit.enabled {
            Some(ExitEndpoint::new(&config.exit, Arc::clone(&routes))?)
        } else {
            None
        };

        let management_public = match &config.management.public_key {
            Some(b64) => Some(parse_x25519_public(b64)?),
            None => None,
        };
        let management_secret = match &config.management.private_key {
            Some(b64) => Some(parse_x25519_secret(b64)?),
            None => None,
        };
        let signing_public = match &config.management.signing_public_key {
            Some(b64) => Some(parse_ed25519_public(b64)?),
            None => None,
        };

        let (events_tx, events_rx) = mpsc::channel(256);
        let (feature_tx, feature_rx) = mpsc::channel(16);

        let core = Arc::new(Core {
            nodes: Arc::new(NodeInfoStore::new(
                identity.id,
                // Descriptors survive a missed flood cycle or two.
                config.routing.node_info_interval * 3,
            )),
            streams: Arc::new(StreamManager::new(config.limits.clone())),
            sessions: Arc::new(SessionManager::new(identity.id)),
            routes,
            exit,
            management_public,
            management_secret,
            signing_public,
            events_tx,
            feature_tx,
            descriptor_version: AtomicU64::new(0),
            started_at: Instant::now(),
            sleeping: AtomicBool::new(false),
            wake: Notify::new(),
            advertise_nudge: Notify::new(),
            associations: AtomicUsize::new(0),
            dynamic_forwards: parking_lot::RwLock::new(HashMap::new()),
            mesh_cache: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            identity,
            config,
        });
        Ok(Self {
            core,
            events_rx,
            feature_rx: Some(feature_rx),
        })
    }

    /// Shared handle for the observer surface and shutdown.
    pub fn handle(&self) -> Arc<Core> {
        Arc::clone(&self.core)
    }

    /// Receiver of incoming feature streams; take it before `run`.
    pub fn take_feature_streams(&mut self) -> Option<mpsc::Receiver<IncomingFeature>> {
        self.feature_rx.take()
    }

    /// Run until shutdown: spawns supervisors, listeners, ingress and
    /// timers, then drives the event loop.
    pub async fn run(mut self) -> Result<(), WeftError> {
        let core = Arc::clone(&self.core);
        // An unclaimed feature receiver would make deliveries block on a
        // full buffer; dropping it turns them into logged failures.
        drop(self.feature_rx.take());
        log::info!(
            "[AGENT] {} ({}) starting",
            core.identity.id,
            if core.identity.display_name.is_empty() {
                "unnamed"
            } else {
                &core.identity.display_name
            }
        );

        for peer in core.config.peers.clone() {
            tokio::spawn(dial_loop(Arc::clone(&core), peer));
        }
        for listener in core.config.listeners.clone() {
            tokio::spawn(listen_loop(Arc::clone(&core), listener));
        }
        if core.config.socks5.enabled {
            let socks_core = Arc::clone(&core);
            tokio::spawn(async move {
                if let Err(e) = crate::socks::run(socks_core).await {
                    log::error!("[SOCKS5] Ingress failed: {}", e);
                }
            });
        }
        for listener in core.config.forward.listeners.clone() {
            let forward_core = Arc::clone(&core);
            tokio::spawn(async move {
                if let Err(e) = crate::forward::run_listener(forward_core, listener).await {
                    log::error!("[FORWARD] Listener failed: {}", e);
                }
            });
        }
        tokio::spawn(advertise_loop(Arc::clone(&core)));
        tokio::spawn(node_info_loop(Arc::clone(&core)));
        tokio::spawn(expiry_loop(Arc::clone(&core)));

        loop {
            let event = tokio::select! {
                _ = core.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            handle_event(&core, event).await;
        }
        log::info!("[AGENT] Stopped");
        Ok(())
    }
}

fn parse_x25519_public(b64: &str) -> Result<x25519_dalek::PublicKey, WeftError> {
    let raw = BASE64
        .decode(b64.trim())
        .map_err(|_| WeftError::Config("bad base64 management public key".into()))?;
    let bytes: [u8; 32] = raw[..]
        .try_into()
        .map_err(|_| WeftError::Config("management public key must be 32 bytes".into()))?;
    Ok(x25519_dalek::PublicKey::from(bytes))
}

fn parse_x25519_secret(b64: &str) -> Result<x25519_dalek::StaticSecret, WeftError> {
    let raw = BASE64
        .decode(b64.trim())
        .map_err(|_| WeftError::Config("bad base64 management private key".into()))?;
    let bytes: [u8; 32] = raw[..]
        .try_into()
        .map_err(|_| WeftError::Config("management private key must be 32 bytes".into()))?;
    Ok(x25519_dalek::StaticSecret::from(bytes))
}

fn parse_ed25519_public(b64: &str) -> Result<ed25519_dalek::VerifyingKey, WeftError> {
    let raw = BASE64
        .decode(b64.trim())
        .map_err(|_| WeftError::Config("bad base64 signing public key".into()))?;
    let bytes: [u8; 32] = raw[..]
        .try_into()
        .map_err(|_| WeftError::Config("signing public key must be 32 bytes".into()))?;
    ed25519_dalek::VerifyingKey::from_bytes(&bytes)
        .map_err(|_| WeftError::Config("invalid signing public key".into()))
}

async fn handle_event(core: &Arc<Core>, event: PeerEvent) {
    match event {
        PeerEvent::Control(session, frame) => handle_control(core, session, frame).await,
        PeerEvent::Substream(session, substream) => {
            tokio::spawn(crate::relay::handle_substream(
                Arc::clone(core),
                session,
                substream,
            ));
        }
        PeerEvent::Closed(session) => {
            if core.sessions.remove(&session) {
                log::info!(
                    "[AGENT] Peer {} ({}) disconnected",
                    session.remote_id.short(),
                    session.remote_name
                );
                core.streams.cancel_peer(session.remote_id);
                let withdrawn = core.routes.purge_peer(session.remote_id);
                if !withdrawn.is_empty() {
                    log::debug!(
                        "[ROUTE] Withdrawing {} routes via lost peer {}",
                        withdrawn.len(),
                        session.remote_id.short()
                    );
                    for peer in core.sessions.list() {
                        let _ = peer
                            .send_control(Frame::RouteWithdraw(withdrawn.clone()))
                            .await;
                    }
                }
            }
        }
    }
}

async fn handle_control(core: &Arc<Core>, session: Arc<PeerSession>, frame: Frame) {
    let now = Instant::now();
    match frame {
        Frame::RouteAdvert(entries) => {
            let mut installed = 0;
            for advert in &entries {
                if core.routes.apply_advert(session.remote_id, advert, now) {
                    installed += 1;
                }
            }
            if installed > 0 {
                log::debug!(
                    "[ROUTE] Installed {}/{} routes from {}",
                    installed,
                    entries.len(),
                    session.remote_id.short()
                );
            }
        }
        Frame::RouteWithdraw(prefixes) => {
            core.routes.apply_withdraw(session.remote_id, &prefixes);
        }
        Frame::NodeInfo(descriptor) => {
            if let Some(reflood) = core.nodes.accept(descriptor, session.remote_id, now) {
                for peer in core.sessions.list() {
                    if peer.remote_id != session.remote_id {
                        let _ = peer.send_control(Frame::NodeInfo(reflood.clone())).await;
                    }
                }
            }
        }
        Frame::StreamClose { stream_id, .. } => {
            core.streams.cancel(session.remote_id, stream_id);
        }
        Frame::Sleep(command) => match command.verify(core.signing_public.as_ref()) {
            Ok(()) => {
                // Re-flood before dropping our links.
                for peer in core.sessions.list() {
                    if peer.remote_id != session.remote_id {
                        let _ = peer.send_control(Frame::Sleep(command.clone())).await;
                    }
                }
                core.enter_sleep().await;
            }
            Err(e) => log::warn!(
                "[AGENT] Rejected sleep command from {}: {}",
                command.issuer.short(),
                e
            ),
        },
        Frame::Wake(command) => match command.verify(core.signing_public.as_ref()) {
            Ok(()) => {
                for peer in core.sessions.list() {
                    if peer.remote_id != session.remote_id {
                        let _ = peer.send_control(Frame::Wake(command.clone())).await;
                    }
                }
                core.leave_sleep();
            }
            Err(e) => log::warn!(
                "[AGENT] Rejected wake command from {}: {}",
                command.issuer.short(),
                e
            ),
        },
        Frame::Error { code, message } => {
            log::debug!(
                "[PEER] {} reported {}: {}",
                session.remote_id.short(),
                code.as_str(),
                message
            );
        }
        other => {
            log::debug!(
                "[PEER] {} sent unexpected control frame {:?}, ignoring",
                session.remote_id.short(),
                std::mem::discriminant(&other)
            );
        }
    }
}

/// Post-handshake registration shared by both supervisors.
async fn install_session(core: &Arc<Core>, session: Arc<PeerSession>) -> bool {
    match core.sessions.admit(Arc::clone(&session)) {
        Admission::Accepted => {}
        Admission::Replaced(old) => {
            log::debug!(
                "[AGENT] Replacing duplicate session to {}",
                old.remote_id.short()
            );
            old.shutdown();
        }
        Admission::Rejected => {
            log::debug!(
                "[AGENT] Duplicate session to {} lost the tie, closing",
                session.remote_id.short()
            );
            session.shutdown();
            return false;
        }
    }
    log::info!(
        "[AGENT] Peer {} ({}) established over {} [{:?}]",
        session.remote_id.short(),
        session.remote_name,
        session.transport_kind(),
        session.direction,
    );

    // Seed the new peer with our view of the world: routes, our own
    // descriptor, and every descriptor we hold (their paths already carry
    // us, so loop suppression holds downstream).
    let adverts = core.routes.adverts_for(session.remote_id);
    if !adverts.is_empty() {
        let _ = session.send_control(Frame::RouteAdvert(adverts)).await;
    }
    if let Ok(descriptor) = core.build_descriptor() {
        let _ = session.send_control(Frame::NodeInfo(descriptor)).await;
    }
    for agent in core.nodes.known_agents() {
        if agent == session.remote_id {
            continue;
        }
        if let Some(descriptor) = core.nodes.get(&agent) {
            let _ = session.send_control(Frame::NodeInfo(descriptor)).await;
        }
    }
    true
}

async fn dial_loop(core: Arc<Core>, peer: PeerConfig) {
    let mut policy = ReconnectPolicy::new(core.config.connections.reconnect.clone());
    let expected: Option<AgentId> = peer
        .id
        .as_deref()
        .and_then(|hex| AgentId::from_hex(hex).ok());

    loop {
        if core.cancel.is_cancelled() {
            return;
        }

        match connect_once(&core, &peer, expected).await {
            Ok(session) => {
                policy.reset();
                session.closed().await;
            }
            Err(e) => {
                log::debug!("[AGENT] Dial {} failed: {}", peer.address, e);
            }
        }

        if policy.exhausted() {
            log::warn!(
                "[AGENT] Giving up on peer {} after {} attempts",
                peer.address,
                policy.attempts()
            );
            return;
        }
        // Sleeping nodes only poke their peers at long intervals, enough
        // to hear a WAKE.
        let delay = if core.is_sleeping() {
            SLEEP_POLL_INTERVAL
        } else {
            policy.next_delay()
        };
        tokio::select! {
            _ = core.cancelled() => return,
            _ = core.wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect_once(
    core: &Arc<Core>,
    peer: &PeerConfig,
    expected: Option<AgentId>,
) -> Result<Arc<PeerSession>, WeftError> {
    let transport =
        crate::transport::dial(peer, &core.config.tls, &core.config.protocol).await?;
    let mut control = transport.open_substream().await?;
    let digest = core
        .build_descriptor()
        .map(|descriptor| descriptor.digest())
        .unwrap_or([0u8; 32]);
    let remote = crate::peer::handshake::dial(&mut control, &core.identity, digest).await?;

    if let Some(expected) = expected {
        if remote.agent_id != expected {
            transport.close(1, "unexpected peer identity").await;
            return Err(WeftError::Unauthorized(format!(
                "peer {} identifies as {}, expected {}",
                peer.address,
                remote.agent_id.short(),
                expected.short()
            )));
        }
    }

    let session = PeerSession::start(
        transport,
        control,
        &remote,
        Direction::Dialer,
        &core.config.connections,
        core.events_tx.clone(),
    );
    if install_session(core, Arc::clone(&session)).await {
        Ok(session)
    } else {
        Err(WeftError::Protocol("duplicate session".into()))
    }
}

async fn listen_loop(core: Arc<Core>, config: ListenerConfig) {
    let listener =
        match crate::transport::listen(&config, &core.config.tls, &core.config.protocol).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("[AGENT] Listener on {} failed: {}", config.address, e);
                return;
            }
        };

    loop {
        let transport = tokio::select! {
            _ = core.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(transport) => transport,
                Err(e) => {
                    log::debug!("[AGENT] Accept on {} failed: {}", config.address, e);
                    continue;
                }
            },
        };

        let core = Arc::clone(&core);
        tokio::spawn(async move {
            let mut control = match transport.accept_substream().await {
                Ok(control) => control,
                Err(e) => {
                    log::debug!("[AGENT] Inbound control substream failed: {}", e);
                    return;
                }
            };
            let digest = core
                .build_descriptor()
                .map(|descriptor| descriptor.digest())
                .unwrap_or([0u8; 32]);
            let remote =
                match crate::peer::handshake::accept(&mut control, &core.identity, digest).await {
                    Ok(remote) => remote,
                    Err(e) => {
                        log::debug!("[AGENT] Inbound handshake failed: {}", e);
                        return;
                    }
                };
            let session = PeerSession::start(
                transport,
                control,
                &remote,
                Direction::Accepted,
                &core.config.connections,
                core.events_tx.clone(),
            );
            install_session(&core, session).await;
        });
    }
}

async fn advertise_loop(core: Arc<Core>) {
    let interval = core.config.routing.advertise_interval;
    loop {
        tokio::select! {
            _ = core.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
            _ = core.advertise_nudge.notified() => {}
        }
        if core.is_sleeping() {
            continue;
        }

        core.routes.expire(Instant::now());
        let withdraws = core.routes.take_pending_withdraws();
        for session in core.sessions.list() {
            if !withdraws.is_empty() {
                let _ = session
                    .send_control(Frame::RouteWithdraw(withdraws.clone()))
                    .await;
            }
            let adverts = core.routes.adverts_for(session.remote_id);
            if !adverts.is_empty() {
                let _ = session.send_control(Frame::RouteAdvert(adverts)).await;
            }
        }
    }
}

async fn node_info_loop(core: Arc<Core>) {
    let interval = core.config.routing.node_info_interval;
    loop {
        tokio::select! {
            _ = core.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if core.is_sleeping() {
            continue;
        }
        if let Ok(descriptor) = core.build_descriptor() {
            for session in core.sessions.list() {
                let _ = session.send_control(Frame::NodeInfo(descriptor.clone())).await;
            }
        }
    }
}

/// Sweep stale routes and descriptors more often than the advertise cycle.
async fn expiry_loop(core: Arc<Core>) {
    loop {
        tokio::select! {
            _ = core.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(15)) => {}
        }
        let now = Instant::now();
        core.routes.expire(now);
        core.nodes.expire(now);
    }
}
