//! PEER_HELLO exchange
//!
//! The dialer opens the control substream and speaks first. Each side sends
//! its hello, then acknowledges the remote's. Version and self-connection
//! checks happen here; duplicate-session resolution is the session
//! manager's job once the remote ID is known.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::Identity;
use crate::proto::{read_frame, write_frame, Frame, PeerHello, PeerHelloAck};
use crate::WeftError;

const STATUS_OK: u8 = 0;
const STATUS_REJECTED: u8 = 1;

fn our_hello(identity: &Identity, node_info_digest: [u8; 32]) -> PeerHello {
    PeerHello {
        agent_id: identity.id,
        display_name: identity.display_name.clone(),
        x25519_public: *identity.public_key().as_bytes(),
        node_info_digest,
        capabilities: 0,
        timestamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    }
}

async fn expect_hello<S: AsyncRead + Unpin>(substream: &mut S) -> Result<PeerHello, WeftError> {
    match read_frame(substream).await? {
        Some(Frame::Hello(hello)) => Ok(hello),
        Some(other) => Err(WeftError::Protocol(format!(
            "expected hello, got {:?}",
            std::mem::discriminant(&other)
        ))),
        None => Err(WeftError::Protocol("peer closed during handshake".into())),
    }
}

async fn expect_ack<S: AsyncRead + Unpin>(substream: &mut S) -> Result<(), WeftError> {
    match read_frame(substream).await? {
        Some(Frame::HelloAck(PeerHelloAck { status: STATUS_OK, .. })) => Ok(()),
        Some(Frame::HelloAck(ack)) => Err(WeftError::Protocol(format!(
            "peer rejected handshake: {}",
            ack.error
        ))),
        Some(_) => Err(WeftError::Protocol("expected hello ack".into())),
        None => Err(WeftError::Protocol("peer closed during handshake".into())),
    }
}

fn validate(identity: &Identity, remote: &PeerHello) -> Result<(), String> {
    if remote.agent_id == identity.id {
        return Err("peer advertises our own agent id".into());
    }
    Ok(())
}

/// Dialer side: send hello, read the remote's, exchange acks.
pub async fn dial<S>(
    substream: &mut S,
    identity: &Identity,
    node_info_digest: [u8; 32],
) -> Result<PeerHello, WeftError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(substream, &Frame::Hello(our_hello(identity, node_info_digest))).await?;
    let remote = expect_hello(substream).await?;
    if let Err(reason) = validate(identity, &remote) {
        write_frame(
            substream,
            &Frame::HelloAck(PeerHelloAck {
                agent_id: identity.id,
                status: STATUS_REJECTED,
                error: reason.clone(),
            }),
        )
        .await?;
        return Err(WeftError::Protocol(reason));
    }
    write_frame(
        substream,
        &Frame::HelloAck(PeerHelloAck {
            agent_id: identity.id,
            status: STATUS_OK,
            error: String::new(),
        }),
    )
    .await?;
    expect_ack(substream).await?;
    Ok(remote)
}

/// Listener side: read the dialer's hello first.
pub async fn accept<S>(
    substream: &mut S,
    identity: &Identity,
    node_info_digest: [u8; 32],
) -> Result<PeerHello, WeftError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = expect_hello(substream).await?;
    if let Err(reason) = validate(identity, &remote) {
        write_frame(
            substream,
            &Frame::HelloAck(PeerHelloAck {
                agent_id: identity.id,
                status: STATUS_REJECTED,
                error: reason.clone(),
            }),
        )
        .await?;
        return Err(WeftError::Protocol(reason));
    }
    write_frame(substream, &Frame::Hello(our_hello(identity, node_info_digest))).await?;
    expect_ack(substream).await?;
    write_frame(
        substream,
        &Frame::HelloAck(PeerHelloAck {
            agent_id: identity.id,
            status: STATUS_OK,
            error: String::new(),
        }),
    )
    .await?;
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_exchanges_identities() {
        let a = Identity::ephemeral("alice");
        let b = Identity::ephemeral("bob");
        let (mut dialer_pipe, mut listener_pipe) = tokio::io::duplex(8192);

        let a_id = a.id;
        let b_id = b.id;
        let dial_task = tokio::spawn(async move { dial(&mut dialer_pipe, &a, [0; 32]).await });
        let accept_task =
            tokio::spawn(async move { accept(&mut listener_pipe, &b, [0; 32]).await });

        let remote_of_a = dial_task.await.unwrap().unwrap();
        let remote_of_b = accept_task.await.unwrap().unwrap();
        assert_eq!(remote_of_a.agent_id, b_id);
        assert_eq!(remote_of_b.agent_id, a_id);
        assert_eq!(remote_of_a.display_name, "bob");
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let a = Identity::ephemeral("alice");
        let a_clone = Identity::ephemeral_with_id(a.id, "alice-mirror");
        let (mut dialer_pipe, mut listener_pipe) = tokio::io::duplex(8192);

        let dial_task = tokio::spawn(async move { dial(&mut dialer_pipe, &a, [0; 32]).await });
        let accept_task =
            tokio::spawn(async move { accept(&mut listener_pipe, &a_clone, [0; 32]).await });

        assert!(dial_task.await.unwrap().is_err());
        assert!(accept_task.await.unwrap().is_err());
    }
}
