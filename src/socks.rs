//! SOCKS5 ingress (RFC 1928, USER/PASS auth per RFC 1929)
//!
//! The front door of the mesh. CONNECT asks the routing engine for a next
//! hop and opens a data stream through it; UDP ASSOCIATE binds a relay
//! socket backed by a udp-kind stream. Passwords are stored as bcrypt
//! hashes and verified off the async path.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::agent::{Core, MeshConn};
use crate::proto::{Destination, StreamKind, WireCode};
use crate::stream::splice_counted;
use crate::udp::UdpAssociation;
use crate::WeftError;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// RFC 1928 reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Map a mesh open failure onto the closest RFC reply.
pub fn reply_for(error: &WeftError) -> Reply {
    match error {
        WeftError::Wire(WireCode::NoRoute) | WeftError::Wire(WireCode::DnsFailed) => {
            Reply::HostUnreachable
        }
        WeftError::Wire(WireCode::DialFailed) => Reply::ConnectionRefused,
        WeftError::Wire(WireCode::TooManyStreams) => Reply::GeneralFailure,
        WeftError::Wire(WireCode::Timeout) => Reply::TtlExpired,
        WeftError::PeerGone(_) => Reply::NetworkUnreachable,
        _ => Reply::GeneralFailure,
    }
}

/// Accept loop. Ends when the core shuts down.
pub async fn run(core: Arc<Core>) -> Result<(), WeftError> {
    let config = core.config.socks5.clone();
    let listener = TcpListener::bind(config.address).await?;
    let permits = Arc::new(Semaphore::new(config.max_connections));
    log::info!("[SOCKS5] Listening on {}", config.address);

    loop {
        let (client, client_addr) = tokio::select! {
            _ = core.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        if core.is_sleeping() {
            // Asleep nodes hold no client connections.
            continue;
        }
        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
            log::warn!("[SOCKS5] Connection limit reached, refusing {}", client_addr);
            continue;
        };
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_client(core, client).await {
                log::debug!("[SOCKS5] Client {} ended: {}", client_addr, e);
            }
        });
    }
}

async fn handle_client(core: Arc<Core>, mut client: TcpStream) -> Result<(), WeftError> {
    negotiate_auth(&core, &mut client).await?;
    let (command, destination) = read_request(&mut client).await?;

    match command {
        CMD_CONNECT => connect(core, client, destination).await,
        CMD_UDP_ASSOCIATE => associate(core, client).await,
        _ => {
            send_reply(&mut client, Reply::CommandNotSupported, None).await?;
            Err(WeftError::Protocol(format!("unsupported command {}", command)))
        }
    }
}

/// Method negotiation plus RFC 1929 USER/PASS when auth is enabled.
async fn negotiate_auth<S>(core: &Arc<Core>, stream: &mut S) -> Result<(), WeftError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(WeftError::Protocol(format!("bad socks version {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let auth = &core.config.socks5.auth;
    if auth.enabled {
        if !methods.contains(&METHOD_USER_PASS) {
            stream.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await?;
            return Err(WeftError::Unauthorized("client offers no user/pass".into()));
        }
        stream.write_all(&[SOCKS_VERSION, METHOD_USER_PASS]).await?;

        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        let mut ver = [0u8; 1];
        stream.read_exact(&mut ver).await?;
        if ver[0] != AUTH_VERSION {
            return Err(WeftError::Protocol("bad auth subnegotiation version".into()));
        }
        let mut len = [0u8; 1];
        stream.read_exact(&mut len).await?;
        let mut username = vec![0u8; len[0] as usize];
        stream.read_exact(&mut username).await?;
        stream.read_exact(&mut len).await?;
        let mut password = vec![0u8; len[0] as usize];
        stream.read_exact(&mut password).await?;

        let username = String::from_utf8_lossy(&username).into_owned();
        let password = String::from_utf8_lossy(&password).into_owned();
        let users = auth.users.clone();
        // bcrypt is deliberately slow; keep it off the reactor.
        let ok = tokio::task::spawn_blocking(move || {
            users.iter().any(|user| {
                user.username == username
                    && bcrypt::verify(&password, &user.password_hash).unwrap_or(false)
            })
        })
        .await
        .unwrap_or(false);

        if ok {
            stream.write_all(&[AUTH_VERSION, 0x00]).await?;
            Ok(())
        } else {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            Err(WeftError::Unauthorized("bad socks credentials".into()))
        }
    } else {
        if !methods.contains(&METHOD_NO_AUTH) {
            stream.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await?;
            return Err(WeftError::Unauthorized("no acceptable auth method".into()));
        }
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    }
}

/// Parse the request line into (command, destination).
async fn read_request<S>(stream: &mut S) -> Result<(u8, Destination), WeftError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(WeftError::Protocol("bad socks version in request".into()));
    }
    let command = head[1];
    let destination = match head[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Destination::V4(octets.into(), u16::from_be_bytes(port))
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            let name = String::from_utf8(name)
                .map_err(|_| WeftError::Protocol("domain is not utf-8".into()))?;
            Destination::Domain(name, u16::from_be_bytes(port))
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Destination::V6(octets.into(), u16::from_be_bytes(port))
        }
        _ => {
            send_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(WeftError::Protocol("unsupported address type".into()));
        }
    };
    Ok((command, destination))
}

pub async fn send_reply<S>(
    stream: &mut S,
    reply: Reply,
    bound: Option<SocketAddr>,
) -> Result<(), WeftError>
where
    S: AsyncWrite + Unpin,
{
    let mut response = vec![SOCKS_VERSION, reply as u8, 0x00];
    match bound {
        Some(SocketAddr::V4(addr)) => {
            response.push(0x01);
            response.extend_from_slice(&addr.ip().octets());
            response.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            response.push(0x04);
            response.extend_from_slice(&addr.ip().octets());
            response.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            response.push(0x01);
            response.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&response).await?;
    Ok(())
}

async fn connect(
    core: Arc<Core>,
    mut client: TcpStream,
    destination: Destination,
) -> Result<(), WeftError> {
    log::info!("[SOCKS5] CONNECT {}", destination);
    let conn = match core
        .open_mesh_stream(StreamKind::Data, destination.clone(), vec![])
        .await
    {
        Ok(conn) => conn,
        Err(e) => {
            log::debug!("[SOCKS5] Open for {} failed: {}", destination, e);
            send_reply(&mut client, reply_for(&e), None).await?;
            return Err(e);
        }
    };

    let local = client.local_addr().ok();
    send_reply(&mut client, Reply::Succeeded, local).await?;

    let buffer = core.streams.limits().buffer_size;
    match conn {
        MeshConn::Stream(stream, handle) => {
            tokio::select! {
                _ = handle.info.cancel.cancelled() => {}
                _ = splice_counted(client, stream, buffer, &handle.info) => {}
            }
        }
        MeshConn::Direct(outbound) => {
            let _ = crate::stream::splice(client, outbound, buffer).await;
        }
        MeshConn::DirectUdp(_) => unreachable!("udp leg for connect"),
    }
    Ok(())
}

async fn associate(core: Arc<Core>, mut client: TcpStream) -> Result<(), WeftError> {
    if !core.config.udp.enabled {
        send_reply(&mut client, Reply::CommandNotSupported, None).await?;
        return Err(WeftError::Protocol("udp associate disabled".into()));
    }
    if !core.try_acquire_association() {
        send_reply(&mut client, Reply::GeneralFailure, None).await?;
        return Err(WeftError::Protocol("association limit reached".into()));
    }
    let result = async {
        let control_local = client.local_addr()?;
        let association = UdpAssociation::bind(control_local).await?;
        let relay_addr = association.local_addr();
        send_reply(&mut client, Reply::Succeeded, Some(relay_addr)).await?;
        log::info!("[SOCKS5] UDP ASSOCIATE relay at {}", relay_addr);
        association.run(Arc::clone(&core), client).await
    }
    .await;
    core.release_association();
    result
}

/// Hash a password for the configuration file.
pub fn hash_password(password: &str) -> Result<String, WeftError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| WeftError::Config(format!("bcrypt: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_rejects_wrong_version() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(&[0x04, 0x01, 0x00, 0x01]).await.unwrap();
        assert!(read_request(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_read_request_domain() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut packet = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, 0x03, 11];
        packet.extend_from_slice(b"example.com");
        packet.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&packet).await.unwrap();

        let (command, destination) = read_request(&mut server).await.unwrap();
        assert_eq!(command, CMD_CONNECT);
        assert_eq!(destination, Destination::Domain("example.com".into(), 80));
    }

    #[tokio::test]
    async fn test_read_request_ipv6() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let ip: std::net::Ipv6Addr = "2001:db8::1".parse().unwrap();
        let mut packet = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, 0x04];
        packet.extend_from_slice(&ip.octets());
        packet.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&packet).await.unwrap();

        let (_, destination) = read_request(&mut server).await.unwrap();
        assert_eq!(destination, Destination::V6(ip, 443));
    }

    #[tokio::test]
    async fn test_reply_encoding() {
        let (mut a, mut b) = tokio::io::duplex(256);
        send_reply(
            &mut a,
            Reply::Succeeded,
            Some("127.0.0.1:1080".parse().unwrap()),
        )
        .await
        .unwrap();
        let mut buf = [0u8; 10];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], SOCKS_VERSION);
        assert_eq!(buf[1], Reply::Succeeded as u8);
        assert_eq!(buf[3], 0x01);
        assert_eq!(&buf[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([buf[8], buf[9]]), 1080);
    }

    #[test]
    fn test_reply_mapping() {
        assert_eq!(reply_for(&WeftError::Wire(WireCode::NoRoute)), Reply::HostUnreachable);
        assert_eq!(reply_for(&WeftError::Wire(WireCode::DnsFailed)), Reply::HostUnreachable);
        assert_eq!(reply_for(&WeftError::Wire(WireCode::DialFailed)), Reply::ConnectionRefused);
        assert_eq!(
            reply_for(&WeftError::Wire(WireCode::TooManyStreams)),
            Reply::GeneralFailure
        );
    }

    #[test]
    fn test_password_hash_verifies() {
        let hash = hash_password("hunter2").unwrap();
        assert!(bcrypt::verify("hunter2", &hash).unwrap());
        assert!(!bcrypt::verify("wrong", &hash).unwrap());
    }
}
