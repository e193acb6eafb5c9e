//! UDP over mesh streams
//!
//! SOCKS5 UDP ASSOCIATE gives the client a relay socket; each datagram is
//! wrapped `{u32 length, destination, payload}` and carried on one
//! per-association stream of kind `udp` through the mesh. The exit unwraps
//! and speaks real UDP; replies flow back through the same stream.
//! Associations expire after `udp.idle_timeout` without traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;

use crate::agent::{Core, MeshConn};
use crate::exit::ExitEndpoint;
use crate::proto::{Destination, StreamKind};
use crate::WeftError;

/// Write one framed datagram onto a mesh stream.
pub async fn write_datagram<W: AsyncWrite + Unpin>(
    w: &mut W,
    destination: &Destination,
    payload: &[u8],
) -> Result<(), WeftError> {
    let mut head = BytesMut::with_capacity(32);
    destination.encode(&mut head);
    w.write_u32((head.len() + payload.len()) as u32).await?;
    w.write_all(&head).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read one framed datagram. `None` on clean EOF.
pub async fn read_datagram<R: AsyncRead + Unpin>(
    r: &mut R,
    max_size: usize,
) -> Result<Option<(Destination, Vec<u8>)>, WeftError> {
    let len = match r.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_size + 64 {
        return Err(WeftError::Protocol(format!("oversized datagram frame: {}", len)));
    }
    let mut raw = BytesMut::zeroed(len);
    r.read_exact(&mut raw).await?;
    let destination = Destination::decode(&mut raw)?;
    Ok(Some((destination, raw.to_vec())))
}

/// SOCKS5 UDP request/reply header (RFC 1928 §7).
///
/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// ```
pub fn parse_socks_udp(packet: &[u8]) -> Result<(Destination, &[u8]), WeftError> {
    if packet.len() < 4 {
        return Err(WeftError::Protocol("short socks udp packet".into()));
    }
    if packet[0] != 0 || packet[1] != 0 {
        return Err(WeftError::Protocol("bad RSV in socks udp packet".into()));
    }
    if packet[2] != 0 {
        // Fragmentation is not supported.
        return Err(WeftError::Protocol("fragmented socks udp packet".into()));
    }
    let mut buf = BytesMut::from(&packet[3..]);
    let before = buf.len();
    let destination = Destination::decode(&mut buf)?;
    let consumed = 3 + (before - buf.len());
    Ok((destination, &packet[consumed..]))
}

pub fn build_socks_udp(source: &Destination, payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(payload.len() + 32);
    out.put_slice(&[0, 0, 0]);
    source.encode(&mut out);
    out.put_slice(payload);
    out.to_vec()
}

/// One UDP ASSOCIATE: relay socket plus its mesh stream.
pub struct UdpAssociation {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpAssociation {
    /// Bind the relay socket on the same interface the TCP control
    /// connection arrived on.
    pub async fn bind(control_local: SocketAddr) -> Result<Self, WeftError> {
        let bind: SocketAddr = SocketAddr::new(control_local.ip(), 0);
        let socket = UdpSocket::bind(bind).await?;
        let local_addr = socket.local_addr()?;
        log::debug!("[UDP] Association relay bound on {}", local_addr);
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shuttle datagrams until the client closes the TCP control
    /// connection or the association idles out.
    pub async fn run(self, core: Arc<Core>, mut control: TcpStream) -> Result<(), WeftError> {
        let max_datagram = core.config.udp.max_datagram_size;
        let idle_timeout = core.config.udp.idle_timeout;
        let mut recv_buf = vec![0u8; max_datagram + 64];
        let mut control_buf = [0u8; 64];

        // Phase 1: the first client datagram decides the route and opens
        // the per-association mesh leg.
        let (client, first_dest, first_payload) = loop {
            tokio::select! {
                // RFC 1928: the association lives as long as the TCP
                // connection that created it.
                n = control.read(&mut control_buf) => match n {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => continue,
                },
                _ = tokio::time::sleep(idle_timeout) => {
                    log::debug!("[UDP] Association on {} idle before first datagram", self.local_addr);
                    return Ok(());
                }
                received = self.socket.recv_from(&mut recv_buf) => {
                    let (n, from) = received?;
                    match parse_socks_udp(&recv_buf[..n]) {
                        Ok((destination, payload)) => break (from, destination, payload.to_vec()),
                        Err(e) => {
                            log::debug!("[UDP] Dropping malformed client datagram: {}", e);
                            continue;
                        }
                    }
                }
            }
        };

        let conn = core
            .open_mesh_stream(StreamKind::Udp, first_dest.clone(), vec![])
            .await?;
        match conn {
            MeshConn::Stream(stream, _handle) => {
                let (mut mesh_read, mut mesh_write) = tokio::io::split(stream);
                write_datagram(&mut mesh_write, &first_dest, &first_payload).await?;
                let mut last_activity = Instant::now();
                loop {
                    let idle_deadline = last_activity + idle_timeout;
                    tokio::select! {
                        n = control.read(&mut control_buf) => match n {
                            Ok(0) | Err(_) => break,
                            Ok(_) => continue,
                        },
                        _ = tokio::time::sleep_until(idle_deadline) => {
                            log::debug!("[UDP] Association on {} idle-expired", self.local_addr);
                            break;
                        }
                        received = self.socket.recv_from(&mut recv_buf) => {
                            let (n, from) = received?;
                            // Only the negotiating client may send.
                            if from != client {
                                continue;
                            }
                            last_activity = Instant::now();
                            match parse_socks_udp(&recv_buf[..n]) {
                                Ok((destination, payload)) => {
                                    write_datagram(&mut mesh_write, &destination, payload).await?;
                                }
                                Err(e) => log::debug!("[UDP] Dropping malformed client datagram: {}", e),
                            }
                        }
                        response = read_datagram(&mut mesh_read, max_datagram) => {
                            let Some((source, payload)) = response? else { break };
                            last_activity = Instant::now();
                            let packet = build_socks_udp(&source, &payload);
                            let _ = self.socket.send_to(&packet, client).await;
                        }
                    }
                }
            }
            // Ingress doubles as exit for this destination: speak real UDP.
            MeshConn::DirectUdp(outbound) => {
                let exit = core
                    .exit
                    .as_ref()
                    .ok_or_else(|| WeftError::Wire(crate::proto::WireCode::NoRoute))?;
                if let Ok(addr) = exit.resolve_validated(&first_dest).await {
                    let _ = outbound.send_to(&first_payload, addr).await;
                }
                let mut out_buf = vec![0u8; max_datagram];
                let mut last_activity = Instant::now();
                loop {
                    let idle_deadline = last_activity + idle_timeout;
                    tokio::select! {
                        n = control.read(&mut control_buf) => match n {
                            Ok(0) | Err(_) => break,
                            Ok(_) => continue,
                        },
                        _ = tokio::time::sleep_until(idle_deadline) => break,
                        received = self.socket.recv_from(&mut recv_buf) => {
                            let (n, from) = received?;
                            if from != client {
                                continue;
                            }
                            last_activity = Instant::now();
                            if let Ok((destination, payload)) = parse_socks_udp(&recv_buf[..n]) {
                                if let Ok(addr) = exit.resolve_validated(&destination).await {
                                    let _ = outbound.send_to(payload, addr).await;
                                }
                            }
                        }
                        received = outbound.recv_from(&mut out_buf) => {
                            let (n, from) = received?;
                            last_activity = Instant::now();
                            let source = Destination::from_host_port(&from.ip().to_string(), from.port());
                            let packet = build_socks_udp(&source, &out_buf[..n]);
                            let _ = self.socket.send_to(&packet, client).await;
                        }
                    }
                }
            }
            MeshConn::Direct(_) => {
                return Err(WeftError::Protocol("tcp leg for udp association".into()))
            }
        }
        Ok(())
    }
}

/// Exit side of a udp-kind stream: unwrap datagrams, speak real UDP, wrap
/// the replies.
pub async fn run_exit_relay(
    exit: &ExitEndpoint,
    mut stream: crate::transport::BoxedSubstream,
    max_datagram: usize,
    idle_timeout: Duration,
) -> Result<(), WeftError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut recv_buf = vec![0u8; max_datagram];
    let mut last_activity = Instant::now();

    loop {
        let idle_deadline = last_activity + idle_timeout;
        tokio::select! {
            _ = tokio::time::sleep_until(idle_deadline) => break,
            inbound = read_datagram(&mut stream, max_datagram) => {
                let Some((destination, payload)) = inbound? else { break };
                last_activity = Instant::now();
                match exit.resolve_validated(&destination).await {
                    Ok(addr) => {
                        let _ = socket.send_to(&payload, addr).await;
                    }
                    Err(e) => log::debug!("[EXIT] Dropping udp to {}: {}", destination, e),
                }
            }
            received = socket.recv_from(&mut recv_buf) => {
                let (n, from) = received?;
                last_activity = Instant::now();
                let source = Destination::from_host_port(&from.ip().to_string(), from.port());
                write_datagram(&mut stream, &source, &recv_buf[..n]).await?;
            }
        }
    }
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_framing_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let dest = Destination::V4("8.8.8.8".parse().unwrap(), 53);
        write_datagram(&mut a, &dest, b"query").await.unwrap();

        let (got_dest, payload) = read_datagram(&mut b, 1500).await.unwrap().unwrap();
        assert_eq!(got_dest, dest);
        assert_eq!(payload, b"query");

        drop(a);
        assert!(read_datagram(&mut b, 1500).await.unwrap().is_none());
    }

    #[test]
    fn test_socks_udp_roundtrip() {
        let dest = Destination::Domain("example.com".into(), 53);
        let packet = build_socks_udp(&dest, b"payload");
        let (parsed, payload) = parse_socks_udp(&packet).unwrap();
        assert_eq!(parsed, dest);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_socks_udp_rejects_fragments() {
        let dest = Destination::V4("1.2.3.4".parse().unwrap(), 53);
        let mut packet = build_socks_udp(&dest, b"x");
        packet[2] = 1;
        assert!(parse_socks_udp(&packet).is_err());
    }

    #[test]
    fn test_socks_udp_rejects_bad_rsv() {
        let dest = Destination::V4("1.2.3.4".parse().unwrap(), 53);
        let mut packet = build_socks_udp(&dest, b"x");
        packet[0] = 9;
        assert!(parse_socks_udp(&packet).is_err());
    }
}
