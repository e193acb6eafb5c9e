//! Incoming stream dispatch: transit splice and local termination
//!
//! Every substream a peer opens starts with a STREAM_OPEN. Destinations are
//! either network addresses (routed by prefix: terminate here as exit, or
//! splice onward as transit) or agent-addressed (`<id>.agent` pseudo-domain
//! for forward and feature streams, routed along the node-info flood path).
//!
//! Transit nodes forward the opener's key material untouched and splice
//! ciphertext; they never hold plaintext or record destinations beyond the
//! routing decision.

use std::sync::Arc;

use rand::rngs::OsRng;
use tokio::io::AsyncWriteExt;
use x25519_dalek::EphemeralSecret;

use crate::agent::Core;
use crate::e2e::E2eStream;
use crate::identity::AgentId;
use crate::peer::session::PeerSession;
use crate::proto::{
    read_frame, write_frame, Destination, Frame, StreamKind, StreamOpen, WireCode,
};
use crate::routing::RouteTarget;
use crate::stream::{splice_counted, PendingOpen};
use crate::transport::BoxedSubstream;
use crate::WeftError;

/// Pseudo-domain addressing an agent instead of a network destination.
pub fn agent_destination(id: AgentId) -> Destination {
    Destination::Domain(format!("{}.agent", id), 0)
}

pub fn parse_agent_destination(destination: &Destination) -> Option<AgentId> {
    match destination {
        Destination::Domain(name, _) => name
            .strip_suffix(".agent")
            .and_then(|head| AgentId::from_hex(head).ok()),
        _ => None,
    }
}

/// Entry point for every substream a peer opens toward us.
pub async fn handle_substream(
    core: Arc<Core>,
    session: Arc<PeerSession>,
    mut substream: BoxedSubstream,
) {
    let open_timeout = core.streams.limits().stream_open_timeout;
    let open = match tokio::time::timeout(open_timeout, read_frame(&mut substream)).await {
        Ok(Ok(Some(Frame::StreamOpen(open)))) => open,
        Ok(Ok(Some(_))) => {
            log::debug!(
                "[RELAY] {} substream did not start with STREAM_OPEN",
                session.remote_id.short()
            );
            return;
        }
        Ok(Ok(None)) | Ok(Err(_)) | Err(_) => return,
    };

    let result = match parse_agent_destination(&open.destination) {
        Some(target) if target == core.identity.id => {
            terminate_agent_stream(&core, &session, substream, open).await
        }
        Some(target) => match core.next_hop_to_agent(target) {
            Some(downstream) => transit(&core, &session, substream, open, downstream).await,
            None => reject_detached(substream, open.request_id, WireCode::NoRoute).await,
        },
        None => {
            match core
                .routes
                .lookup_with_metric(&open.destination, Some(session.remote_id))
            {
                Some((RouteTarget::Local, _)) => {
                    terminate_exit(&core, &session, substream, open).await
                }
                Some((RouteTarget::Peer(next), _)) => match core.sessions.get(&next) {
                    Some(downstream) => {
                        transit(&core, &session, substream, open, downstream).await
                    }
                    None => reject_detached(substream, open.request_id, WireCode::NoRoute).await,
                },
                None => reject_detached(substream, open.request_id, WireCode::NoRoute).await,
            }
        }
    };

    if let Err(e) = result {
        log::debug!(
            "[RELAY] Stream from {} ended with error: {}",
            session.remote_id.short(),
            e
        );
    }
}

async fn reject_detached(
    mut substream: BoxedSubstream,
    request_id: u64,
    code: WireCode,
) -> Result<(), WeftError> {
    PeerSession::send_open_ack(&mut substream, request_id, 0, code, [0u8; 32]).await?;
    let _ = substream.shutdown().await;
    Ok(())
}

/// Accept the open: reserve limits, answer the ack, and wrap the substream
/// in the end-to-end layer unless the opener flagged a single hop.
async fn accept_open(
    core: &Arc<Core>,
    session: &Arc<PeerSession>,
    mut substream: BoxedSubstream,
    open: &StreamOpen,
) -> Result<Option<(BoxedSubstream, crate::stream::StreamHandle)>, WeftError> {
    let pending = match core.streams.begin_open(session.remote_id) {
        Ok(pending) => pending,
        Err(code) => {
            reject_detached(substream, open.request_id, code).await?;
            return Ok(None);
        }
    };

    let (ack_public, ephemeral) = if open.e2e_skip() {
        ([0u8; 32], None)
    } else {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        (*x25519_dalek::PublicKey::from(&secret).as_bytes(), Some(secret))
    };

    let local_id = core.streams.allocate_id();
    PeerSession::send_open_ack(&mut substream, open.request_id, local_id, WireCode::Ok, ack_public)
        .await?;

    let substream = match ephemeral {
        Some(secret) => {
            let opener = x25519_dalek::PublicKey::from(open.e2e_public);
            let shared = secret.diffie_hellman(&opener);
            Box::new(E2eStream::new(substream, shared.as_bytes(), false)?) as BoxedSubstream
        }
        None => substream,
    };

    let handle = core.streams.register(
        pending,
        local_id,
        session.remote_id,
        open.kind,
        open.destination.to_string(),
    );
    Ok(Some((substream, handle)))
}

/// Terminate a prefix-routed stream as the exit.
async fn terminate_exit(
    core: &Arc<Core>,
    session: &Arc<PeerSession>,
    substream: BoxedSubstream,
    open: StreamOpen,
) -> Result<(), WeftError> {
    let Some(exit) = core.exit.as_ref() else {
        return reject_detached(substream, open.request_id, WireCode::NoRoute).await;
    };

    match open.kind {
        StreamKind::Data => {
            // Dial first so a failure is reported in the ack.
            let outbound = match exit.dial(&open.destination).await {
                Ok(stream) => stream,
                Err(e) => {
                    return reject_detached(substream, open.request_id, e.wire_code()).await;
                }
            };
            let Some((stream, handle)) = accept_open(core, session, substream, &open).await? else {
                return Ok(());
            };
            let buffer = core.streams.limits().buffer_size;
            tokio::select! {
                _ = handle.info.cancel.cancelled() => {}
                result = splice_counted(stream, outbound, buffer, &handle.info) => {
                    if let Ok((sent, received)) = result {
                        log::debug!(
                            "[EXIT] {} closed: {} bytes out, {} bytes back",
                            open.destination, sent, received
                        );
                    }
                }
            }
            Ok(())
        }
        StreamKind::Udp => {
            let Some((stream, handle)) = accept_open(core, session, substream, &open).await? else {
                return Ok(());
            };
            let max_datagram = core.config.udp.max_datagram_size;
            let idle = core.config.udp.idle_timeout;
            tokio::select! {
                _ = handle.info.cancel.cancelled() => Ok(()),
                result = crate::udp::run_exit_relay(exit, stream, max_datagram, idle) => result,
            }
        }
        _ => reject_detached(substream, open.request_id, WireCode::NoRoute).await,
    }
}

/// Terminate an agent-addressed stream: forward exits, the built-in status
/// probe, and feature streams handed to the embedding layer.
async fn terminate_agent_stream(
    core: &Arc<Core>,
    session: &Arc<PeerSession>,
    substream: BoxedSubstream,
    open: StreamOpen,
) -> Result<(), WeftError> {
    match open.kind {
        StreamKind::Forward => {
            let key = String::from_utf8(open.tail.clone())
                .map_err(|_| WeftError::Protocol("forward key is not utf-8".into()))?;
            let Some(target) = core.forward_exit_target(&key) else {
                log::debug!("[FORWARD] No exit endpoint for key {:?}", key);
                return reject_detached(substream, open.request_id, WireCode::NoRoute).await;
            };
            let outbound = match tokio::net::TcpStream::connect(&target).await {
                Ok(stream) => stream,
                Err(e) => {
                    log::debug!("[FORWARD] Dial {} failed: {}", target, e);
                    return reject_detached(substream, open.request_id, WireCode::DialFailed).await;
                }
            };
            let Some((stream, handle)) = accept_open(core, session, substream, &open).await? else {
                return Ok(());
            };
            let buffer = core.streams.limits().buffer_size;
            tokio::select! {
                _ = handle.info.cancel.cancelled() => {}
                _ = splice_counted(stream, outbound, buffer, &handle.info) => {}
            }
            Ok(())
        }
        StreamKind::Rpc if open.tail == b"probe" => {
            let Some((mut stream, _handle)) = accept_open(core, session, substream, &open).await?
            else {
                return Ok(());
            };
            let status = serde_json::json!({
                "agent": core.identity.id,
                "ok": true,
            });
            stream.write_all(status.to_string().as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        }
        StreamKind::Shell | StreamKind::File | StreamKind::Icmp | StreamKind::Rpc => {
            let Some((stream, handle)) = accept_open(core, session, substream, &open).await? else {
                return Ok(());
            };
            core.deliver_feature(session.remote_id, open.kind, open.tail, stream, handle)
                .await;
            Ok(())
        }
        StreamKind::Data | StreamKind::Udp | StreamKind::Control => {
            reject_detached(substream, open.request_id, WireCode::NoRoute).await
        }
    }
}

/// Middle hop: open the same request downstream, relay the ack, splice the
/// two substreams without touching payload bytes.
async fn transit(
    core: &Arc<Core>,
    upstream_session: &Arc<PeerSession>,
    mut upstream: BoxedSubstream,
    open: StreamOpen,
    downstream_session: Arc<PeerSession>,
) -> Result<(), WeftError> {
    let pending: PendingOpen = match core.streams.begin_open(downstream_session.remote_id) {
        Ok(pending) => pending,
        Err(code) => return reject_detached(upstream, open.request_id, code).await,
    };

    let mut downstream = match downstream_session.open_raw_substream().await {
        Ok(substream) => substream,
        Err(e) => {
            log::debug!(
                "[TRANSIT] Substream toward {} failed: {}",
                downstream_session.remote_id.short(),
                e
            );
            return reject_detached(upstream, open.request_id, WireCode::DialFailed).await;
        }
    };

    let down_request_id = core.streams.allocate_id();
    write_frame(
        &mut downstream,
        &Frame::StreamOpen(StreamOpen {
            kind: open.kind,
            destination: open.destination.clone(),
            // The opener's key material crosses us opaquely.
            e2e_public: open.e2e_public,
            flags: open.flags,
            request_id: down_request_id,
            tail: open.tail.clone(),
        }),
    )
    .await?;

    let ack = tokio::time::timeout(
        core.streams.limits().stream_open_timeout,
        read_frame(&mut downstream),
    )
    .await;
    let ack = match ack {
        Ok(Ok(Some(Frame::StreamOpenAck(ack)))) => ack,
        Ok(Ok(_)) | Ok(Err(_)) => {
            return reject_detached(upstream, open.request_id, WireCode::DialFailed).await;
        }
        Err(_) => {
            return reject_detached(upstream, open.request_id, WireCode::Timeout).await;
        }
    };

    let local_id = core.streams.allocate_id();
    PeerSession::send_open_ack(
        &mut upstream,
        open.request_id,
        local_id,
        ack.status,
        ack.e2e_public,
    )
    .await?;
    if ack.status != WireCode::Ok {
        return Ok(());
    }

    let handle = core.streams.register(
        pending,
        local_id,
        upstream_session.remote_id,
        open.kind,
        open.destination.to_string(),
    );
    let buffer = core.streams.limits().buffer_size;
    tokio::select! {
        _ = handle.info.cancel.cancelled() => {}
        result = splice_counted(upstream, downstream, buffer, &handle.info) => {
            if let Err(e) = result {
                log::debug!("[TRANSIT] Splice for {} ended: {}", open.destination, e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_destination_roundtrip() {
        let id = AgentId::generate();
        let dest = agent_destination(id);
        assert_eq!(parse_agent_destination(&dest), Some(id));
    }

    #[test]
    fn test_plain_destination_not_agent() {
        assert!(parse_agent_destination(&Destination::Domain("example.com".into(), 80)).is_none());
        assert!(parse_agent_destination(&Destination::V4("1.2.3.4".parse().unwrap(), 80)).is_none());
        assert!(
            parse_agent_destination(&Destination::Domain("nothex.agent".into(), 0)).is_none()
        );
    }
}
