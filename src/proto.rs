//! Peer-link wire protocol
//!
//! Every substream carries length-delimited frames: a 4-byte big-endian
//! length followed by a 1-byte frame type and the frame body. Fixed-layout
//! frames (hello, keepalive, stream open/ack/close) are encoded by hand;
//! structured payloads (route adverts, node descriptors, signed commands)
//! ride as JSON bodies.
//!
//! Data substreams speak exactly one `StreamOpen` / `StreamOpenAck` exchange
//! and then switch to raw (optionally end-to-end encrypted) bytes. The
//! control substream carries control frames for the life of the session and
//! is never reused for data.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::SignedCommand;
use crate::identity::AgentId;
use crate::nodeinfo::NodeDescriptor;
use crate::routing::{RouteAdvert, RoutePrefix};
use crate::WeftError;

/// Frame magic for PEER_HELLO.
pub const HELLO_MAGIC: u32 = 0x5745_4654;
/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;
/// Hard cap on a single frame, control or handshake.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// STREAM_OPEN flag: endpoints are direct peers, transport TLS suffices.
pub const FLAG_E2E_SKIP: u32 = 0x0000_0001;

mod frame_type {
    pub const HELLO: u8 = 0x01;
    pub const HELLO_ACK: u8 = 0x02;
    pub const KEEPALIVE: u8 = 0x10;
    pub const KEEPALIVE_ACK: u8 = 0x11;
    pub const NODE_INFO: u8 = 0x20;
    pub const ROUTE_ADVERT: u8 = 0x21;
    pub const ROUTE_WITHDRAW: u8 = 0x22;
    pub const STREAM_OPEN: u8 = 0x30;
    pub const STREAM_OPEN_ACK: u8 = 0x31;
    pub const STREAM_CLOSE: u8 = 0x32;
    pub const SLEEP: u8 = 0x40;
    pub const WAKE: u8 = 0x41;
    pub const ERROR: u8 = 0x50;
}

/// Stream kinds carried in STREAM_OPEN. Non-data kinds are routed and
/// limited identically; their payload protocols are opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Data,
    Control,
    Rpc,
    File,
    Shell,
    Icmp,
    Udp,
    Forward,
}

impl StreamKind {
    pub fn to_wire(self) -> u8 {
        match self {
            StreamKind::Data => 0,
            StreamKind::Control => 1,
            StreamKind::Rpc => 2,
            StreamKind::File => 3,
            StreamKind::Shell => 4,
            StreamKind::Icmp => 5,
            StreamKind::Udp => 6,
            StreamKind::Forward => 7,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self, WeftError> {
        Ok(match v {
            0 => StreamKind::Data,
            1 => StreamKind::Control,
            2 => StreamKind::Rpc,
            3 => StreamKind::File,
            4 => StreamKind::Shell,
            5 => StreamKind::Icmp,
            6 => StreamKind::Udp,
            7 => StreamKind::Forward,
            other => return Err(WeftError::Protocol(format!("unknown stream kind {}", other))),
        })
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamKind::Data => "data",
            StreamKind::Control => "control",
            StreamKind::Rpc => "rpc",
            StreamKind::File => "file",
            StreamKind::Shell => "shell",
            StreamKind::Icmp => "icmp",
            StreamKind::Udp => "udp",
            StreamKind::Forward => "forward",
        };
        f.write_str(s)
    }
}

/// Destination of an outbound stream, SOCKS-style.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Destination {
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Destination::V4(ip, port),
            Ok(IpAddr::V6(ip)) => Destination::V6(ip, port),
            Err(_) => Destination::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Destination::V4(_, p) | Destination::V6(_, p) | Destination::Domain(_, p) => *p,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Destination::V4(ip, _) => ip.to_string(),
            Destination::V6(ip, _) => ip.to_string(),
            Destination::Domain(d, _) => d.clone(),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Destination::V4(ip, _) => Some(IpAddr::V4(*ip)),
            Destination::V6(ip, _) => Some(IpAddr::V6(*ip)),
            Destination::Domain(_, _) => None,
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        match self {
            Destination::V4(ip, port) => {
                buf.put_u8(0x01);
                buf.put_u16(*port);
                buf.put_slice(&ip.octets());
            }
            Destination::Domain(name, port) => {
                buf.put_u8(0x03);
                buf.put_u16(*port);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
            Destination::V6(ip, port) => {
                buf.put_u8(0x04);
                buf.put_u16(*port);
                buf.put_slice(&ip.octets());
            }
        }
    }

    pub(crate) fn decode(buf: &mut BytesMut) -> Result<Self, WeftError> {
        let atyp = get_u8(buf)?;
        let port = get_u16(buf)?;
        match atyp {
            0x01 => {
                let mut octets = [0u8; 4];
                get_exact(buf, &mut octets)?;
                Ok(Destination::V4(Ipv4Addr::from(octets), port))
            }
            0x03 => {
                let len = get_u8(buf)? as usize;
                let mut raw = vec![0u8; len];
                get_exact(buf, &mut raw)?;
                let name = String::from_utf8(raw)
                    .map_err(|_| WeftError::Protocol("destination is not utf-8".into()))?;
                Ok(Destination::Domain(name, port))
            }
            0x04 => {
                let mut octets = [0u8; 16];
                get_exact(buf, &mut octets)?;
                Ok(Destination::V6(Ipv6Addr::from(octets), port))
            }
            other => Err(WeftError::Protocol(format!("unknown addr type {}", other))),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::V4(ip, port) => write!(f, "{}:{}", ip, port),
            Destination::V6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Destination::Domain(d, port) => write!(f, "{}:{}", d, port),
        }
    }
}

/// Result codes for STREAM_OPEN_ACK and CTRL_ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireCode {
    Ok,
    NoRoute,
    DialFailed,
    DnsFailed,
    TooManyStreams,
    Integrity,
    Unauthorized,
    Timeout,
    Internal,
}

impl WireCode {
    pub fn to_wire(self) -> u8 {
        match self {
            WireCode::Ok => 0,
            WireCode::NoRoute => 1,
            WireCode::DialFailed => 2,
            WireCode::DnsFailed => 3,
            WireCode::TooManyStreams => 4,
            WireCode::Integrity => 5,
            WireCode::Unauthorized => 6,
            WireCode::Timeout => 7,
            WireCode::Internal => 8,
        }
    }

    pub fn from_wire(v: u8) -> Self {
        match v {
            0 => WireCode::Ok,
            1 => WireCode::NoRoute,
            2 => WireCode::DialFailed,
            3 => WireCode::DnsFailed,
            4 => WireCode::TooManyStreams,
            5 => WireCode::Integrity,
            6 => WireCode::Unauthorized,
            7 => WireCode::Timeout,
            _ => WireCode::Internal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WireCode::Ok => "ok",
            WireCode::NoRoute => "no_route",
            WireCode::DialFailed => "dial_failed",
            WireCode::DnsFailed => "dns_failed",
            WireCode::TooManyStreams => "too_many_streams",
            WireCode::Integrity => "integrity",
            WireCode::Unauthorized => "unauthorized",
            WireCode::Timeout => "timeout",
            WireCode::Internal => "internal",
        }
    }
}

/// First frame on any new peer session, sent by the dialer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHello {
    pub agent_id: AgentId,
    pub display_name: String,
    pub x25519_public: [u8; 32],
    pub node_info_digest: [u8; 32],
    pub capabilities: u32,
    pub timestamp: u64,
}

/// Listener's reply to PEER_HELLO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHelloAck {
    pub agent_id: AgentId,
    pub status: u8,
    pub error: String,
}

/// Header opening a logical stream, first frame on a fresh data substream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpen {
    pub kind: StreamKind,
    pub destination: Destination,
    pub e2e_public: [u8; 32],
    pub flags: u32,
    pub request_id: u64,
    /// Kind-specific tail (filename for file kind, forward key, ...).
    pub tail: Vec<u8>,
}

impl StreamOpen {
    pub fn e2e_skip(&self) -> bool {
        self.flags & FLAG_E2E_SKIP != 0
    }
}

/// Reply to STREAM_OPEN on the same substream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenAck {
    pub request_id: u64,
    /// Acceptor's local stream ID; 0 on failure.
    pub stream_id: u64,
    pub status: WireCode,
    pub e2e_public: [u8; 32],
}

/// All frames that cross a peer substream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello(PeerHello),
    HelloAck(PeerHelloAck),
    Keepalive { nonce: u64, timestamp: u64 },
    KeepaliveAck { nonce: u64 },
    NodeInfo(NodeDescriptor),
    RouteAdvert(Vec<RouteAdvert>),
    RouteWithdraw(Vec<RoutePrefix>),
    StreamOpen(StreamOpen),
    StreamOpenAck(StreamOpenAck),
    StreamClose { stream_id: u64, direction: u8 },
    Sleep(SignedCommand),
    Wake(SignedCommand),
    Error { code: WireCode, message: String },
}

impl Frame {
    /// Serialize into a body (frame type byte included, length prefix not).
    pub fn encode(&self) -> Result<BytesMut, WeftError> {
        let mut buf = BytesMut::with_capacity(128);
        match self {
            Frame::Hello(h) => {
                buf.put_u8(frame_type::HELLO);
                buf.put_u32(HELLO_MAGIC);
                buf.put_u16(PROTOCOL_VERSION);
                buf.put_slice(h.agent_id.as_bytes());
                buf.put_u8(h.display_name.len() as u8);
                buf.put_slice(h.display_name.as_bytes());
                buf.put_slice(&h.x25519_public);
                buf.put_slice(&h.node_info_digest);
                buf.put_u32(h.capabilities);
                buf.put_u64(h.timestamp);
            }
            Frame::HelloAck(a) => {
                buf.put_u8(frame_type::HELLO_ACK);
                buf.put_slice(a.agent_id.as_bytes());
                buf.put_u8(a.status);
                buf.put_u16(a.error.len() as u16);
                buf.put_slice(a.error.as_bytes());
            }
            Frame::Keepalive { nonce, timestamp } => {
                buf.put_u8(frame_type::KEEPALIVE);
                buf.put_u64(*nonce);
                buf.put_u64(*timestamp);
            }
            Frame::KeepaliveAck { nonce } => {
                buf.put_u8(frame_type::KEEPALIVE_ACK);
                buf.put_u64(*nonce);
            }
            Frame::NodeInfo(desc) => {
                buf.put_u8(frame_type::NODE_INFO);
                buf.put_slice(&serde_json::to_vec(desc)?);
            }
            Frame::RouteAdvert(entries) => {
                buf.put_u8(frame_type::ROUTE_ADVERT);
                buf.put_slice(&serde_json::to_vec(entries)?);
            }
            Frame::RouteWithdraw(prefixes) => {
                buf.put_u8(frame_type::ROUTE_WITHDRAW);
                buf.put_slice(&serde_json::to_vec(prefixes)?);
            }
            Frame::StreamOpen(open) => {
                buf.put_u8(frame_type::STREAM_OPEN);
                buf.put_u8(open.kind.to_wire());
                open.destination.encode(&mut buf);
                buf.put_slice(&open.e2e_public);
                buf.put_u32(open.flags);
                buf.put_u64(open.request_id);
                buf.put_slice(&open.tail);
            }
            Frame::StreamOpenAck(ack) => {
                buf.put_u8(frame_type::STREAM_OPEN_ACK);
                buf.put_u64(ack.request_id);
                buf.put_u64(ack.stream_id);
                buf.put_u8(ack.status.to_wire());
                buf.put_slice(&ack.e2e_public);
            }
            Frame::StreamClose { stream_id, direction } => {
                buf.put_u8(frame_type::STREAM_CLOSE);
                buf.put_u64(*stream_id);
                buf.put_u8(*direction);
            }
            Frame::Sleep(cmd) => {
                buf.put_u8(frame_type::SLEEP);
                buf.put_slice(&serde_json::to_vec(cmd)?);
            }
            Frame::Wake(cmd) => {
                buf.put_u8(frame_type::WAKE);
                buf.put_slice(&serde_json::to_vec(cmd)?);
            }
            Frame::Error { code, message } => {
                buf.put_u8(frame_type::ERROR);
                buf.put_u8(code.to_wire());
                buf.put_u16(message.len() as u16);
                buf.put_slice(message.as_bytes());
            }
        }
        Ok(buf)
    }

    /// Parse a frame body. Unknown frame types surface as a protocol error;
    /// callers on the control path log and ignore them.
    pub fn decode(mut buf: BytesMut) -> Result<Self, WeftError> {
        let ftype = get_u8(&mut buf)?;
        match ftype {
            frame_type::HELLO => {
                let magic = get_u32(&mut buf)?;
                if magic != HELLO_MAGIC {
                    return Err(WeftError::Protocol(format!("bad hello magic {:#x}", magic)));
                }
                let version = get_u16(&mut buf)?;
                if version != PROTOCOL_VERSION {
                    return Err(WeftError::Protocol(format!(
                        "protocol version mismatch: ours {}, theirs {}",
                        PROTOCOL_VERSION, version
                    )));
                }
                let agent_id = get_agent_id(&mut buf)?;
                let name_len = get_u8(&mut buf)? as usize;
                let mut name_raw = vec![0u8; name_len];
                get_exact(&mut buf, &mut name_raw)?;
                let display_name = String::from_utf8(name_raw)
                    .map_err(|_| WeftError::Protocol("display name is not utf-8".into()))?;
                let mut x25519_public = [0u8; 32];
                get_exact(&mut buf, &mut x25519_public)?;
                let mut node_info_digest = [0u8; 32];
                get_exact(&mut buf, &mut node_info_digest)?;
                let capabilities = get_u32(&mut buf)?;
                let timestamp = get_u64(&mut buf)?;
                Ok(Frame::Hello(PeerHello {
                    agent_id,
                    display_name,
                    x25519_public,
                    node_info_digest,
                    capabilities,
                    timestamp,
                }))
            }
            frame_type::HELLO_ACK => {
                let agent_id = get_agent_id(&mut buf)?;
                let status = get_u8(&mut buf)?;
                let err_len = get_u16(&mut buf)? as usize;
                let mut raw = vec![0u8; err_len];
                get_exact(&mut buf, &mut raw)?;
                let error = String::from_utf8(raw)
                    .map_err(|_| WeftError::Protocol("error text is not utf-8".into()))?;
                Ok(Frame::HelloAck(PeerHelloAck { agent_id, status, error }))
            }
            frame_type::KEEPALIVE => Ok(Frame::Keepalive {
                nonce: get_u64(&mut buf)?,
                timestamp: get_u64(&mut buf)?,
            }),
            frame_type::KEEPALIVE_ACK => Ok(Frame::KeepaliveAck { nonce: get_u64(&mut buf)? }),
            frame_type::NODE_INFO => Ok(Frame::NodeInfo(serde_json::from_slice(&buf)?)),
            frame_type::ROUTE_ADVERT => Ok(Frame::RouteAdvert(serde_json::from_slice(&buf)?)),
            frame_type::ROUTE_WITHDRAW => Ok(Frame::RouteWithdraw(serde_json::from_slice(&buf)?)),
            frame_type::STREAM_OPEN => {
                let kind = StreamKind::from_wire(get_u8(&mut buf)?)?;
                let destination = Destination::decode(&mut buf)?;
                let mut e2e_public = [0u8; 32];
                get_exact(&mut buf, &mut e2e_public)?;
                let flags = get_u32(&mut buf)?;
                let request_id = get_u64(&mut buf)?;
                let tail = buf.to_vec();
                Ok(Frame::StreamOpen(StreamOpen {
                    kind,
                    destination,
                    e2e_public,
                    flags,
                    request_id,
                    tail,
                }))
            }
            frame_type::STREAM_OPEN_ACK => {
                let request_id = get_u64(&mut buf)?;
                let stream_id = get_u64(&mut buf)?;
                let status = WireCode::from_wire(get_u8(&mut buf)?);
                let mut e2e_public = [0u8; 32];
                get_exact(&mut buf, &mut e2e_public)?;
                Ok(Frame::StreamOpenAck(StreamOpenAck {
                    request_id,
                    stream_id,
                    status,
                    e2e_public,
                }))
            }
            frame_type::STREAM_CLOSE => Ok(Frame::StreamClose {
                stream_id: get_u64(&mut buf)?,
                direction: get_u8(&mut buf)?,
            }),
            frame_type::SLEEP => Ok(Frame::Sleep(serde_json::from_slice(&buf)?)),
            frame_type::WAKE => Ok(Frame::Wake(serde_json::from_slice(&buf)?)),
            frame_type::ERROR => {
                let code = WireCode::from_wire(get_u8(&mut buf)?);
                let msg_len = get_u16(&mut buf)? as usize;
                let mut raw = vec![0u8; msg_len];
                get_exact(&mut buf, &mut raw)?;
                let message = String::from_utf8(raw)
                    .map_err(|_| WeftError::Protocol("error text is not utf-8".into()))?;
                Ok(Frame::Error { code, message })
            }
            other => Err(WeftError::UnknownFrame(other)),
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), WeftError> {
    let body = frame.encode()?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WeftError::Protocol(format!("frame too large: {}", body.len())));
    }
    w.write_u32(body.len() as u32).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `None` on clean EOF at a frame
/// boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, WeftError> {
    let len = match r.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(WeftError::Protocol(format!("oversized frame: {} bytes", len)));
    }
    let mut body = BytesMut::zeroed(len);
    r.read_exact(&mut body).await?;
    Frame::decode(body).map(Some)
}

fn get_u8(buf: &mut BytesMut) -> Result<u8, WeftError> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut BytesMut) -> Result<u16, WeftError> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut BytesMut) -> Result<u32, WeftError> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut BytesMut) -> Result<u64, WeftError> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64())
}

fn get_exact(buf: &mut BytesMut, out: &mut [u8]) -> Result<(), WeftError> {
    if buf.remaining() < out.len() {
        return Err(truncated());
    }
    buf.copy_to_slice(out);
    Ok(())
}

fn get_agent_id(buf: &mut BytesMut) -> Result<AgentId, WeftError> {
    let mut raw = [0u8; 16];
    get_exact(buf, &mut raw)?;
    Ok(AgentId(raw))
}

fn truncated() -> WeftError {
    WeftError::Protocol("truncated frame".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutePrefix;

    fn roundtrip(frame: Frame) {
        let body = frame.encode().unwrap();
        let decoded = Frame::decode(body).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_hello_roundtrip() {
        roundtrip(Frame::Hello(PeerHello {
            agent_id: AgentId::generate(),
            display_name: "edge-1".into(),
            x25519_public: [7u8; 32],
            node_info_digest: [9u8; 32],
            capabilities: 0b101,
            timestamp: 1_700_000_000,
        }));
    }

    #[test]
    fn test_hello_ack_roundtrip() {
        roundtrip(Frame::HelloAck(PeerHelloAck {
            agent_id: AgentId::generate(),
            status: 0,
            error: String::new(),
        }));
        roundtrip(Frame::HelloAck(PeerHelloAck {
            agent_id: AgentId::generate(),
            status: 1,
            error: "duplicate session".into(),
        }));
    }

    #[test]
    fn test_keepalive_roundtrip() {
        roundtrip(Frame::Keepalive { nonce: 42, timestamp: 99 });
        roundtrip(Frame::KeepaliveAck { nonce: 42 });
    }

    #[test]
    fn test_stream_open_roundtrip_all_addr_types() {
        for destination in [
            Destination::V4("10.1.2.3".parse().unwrap(), 22),
            Destination::V6("2001:db8::1".parse().unwrap(), 443),
            Destination::Domain("example.com".into(), 80),
        ] {
            roundtrip(Frame::StreamOpen(StreamOpen {
                kind: StreamKind::Data,
                destination,
                e2e_public: [3u8; 32],
                flags: FLAG_E2E_SKIP,
                request_id: 77,
                tail: vec![],
            }));
        }
    }

    #[test]
    fn test_stream_open_tail_preserved() {
        roundtrip(Frame::StreamOpen(StreamOpen {
            kind: StreamKind::Forward,
            destination: Destination::Domain("ignored".into(), 0),
            e2e_public: [0u8; 32],
            flags: 0,
            request_id: 1,
            tail: b"office-gw".to_vec(),
        }));
    }

    #[test]
    fn test_stream_open_ack_roundtrip() {
        roundtrip(Frame::StreamOpenAck(StreamOpenAck {
            request_id: 77,
            stream_id: 12,
            status: WireCode::Ok,
            e2e_public: [5u8; 32],
        }));
        roundtrip(Frame::StreamOpenAck(StreamOpenAck {
            request_id: 78,
            stream_id: 0,
            status: WireCode::NoRoute,
            e2e_public: [0u8; 32],
        }));
    }

    #[test]
    fn test_route_frames_roundtrip() {
        let advert = RouteAdvert {
            prefix: RoutePrefix::Cidr("10.0.0.0/8".parse().unwrap()),
            origin: AgentId::generate(),
            metric: 2,
            path: vec![AgentId::generate(), AgentId::generate()],
        };
        roundtrip(Frame::RouteAdvert(vec![advert]));
        roundtrip(Frame::RouteWithdraw(vec![
            RoutePrefix::Cidr("192.168.0.0/16".parse().unwrap()),
            RoutePrefix::Domain("*.internal.example".into()),
        ]));
    }

    #[test]
    fn test_error_frame_roundtrip() {
        roundtrip(Frame::Error {
            code: WireCode::TooManyStreams,
            message: "per-peer stream limit reached".into(),
        });
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xEE);
        buf.put_slice(b"future frame");
        match Frame::decode(buf) {
            Err(WeftError::UnknownFrame(0xEE)) => {}
            other => panic!("expected UnknownFrame, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = Frame::Keepalive { nonce: 1, timestamp: 2 };
        let mut body = frame.encode().unwrap();
        body.truncate(body.len() - 3);
        assert!(Frame::decode(body).is_err());
    }

    #[tokio::test]
    async fn test_length_delimited_io() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::Keepalive { nonce: 7, timestamp: 1234 };
        write_frame(&mut a, &frame).await.unwrap();
        let read = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(frame, read);

        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
