//! Forward routing: keyed listener/exit pairs
//!
//! Independent of CIDR routing, an ingress listener and an exit endpoint
//! that share a short key are paired by the mesh: bytes accepted on the
//! listener ride a forward-kind stream to whichever agent advertises the
//! key, which dials its configured target. Forward streams may be paced
//! with the token bucket.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::agent::Core;
use crate::config::ForwardListener;
use crate::pacer::Pacer;
use crate::proto::StreamKind;
use crate::stream::splice_counted;
use crate::WeftError;

/// Accept loop for one configured forward listener.
pub async fn run_listener(core: Arc<Core>, listener: ForwardListener) -> Result<(), WeftError> {
    let tcp = TcpListener::bind(listener.bind).await?;
    log::info!(
        "[FORWARD] Listener for key {:?} on {}",
        listener.key,
        listener.bind
    );

    loop {
        let (client, client_addr) = tokio::select! {
            _ = core.cancelled() => return Ok(()),
            accepted = tcp.accept() => accepted?,
        };
        let core = Arc::clone(&core);
        let key = listener.key.clone();
        let rate = listener.rate;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(core, key, rate, client).await {
                log::debug!("[FORWARD] Connection from {} ended: {}", client_addr, e);
            }
        });
    }
}

async fn handle_connection(
    core: Arc<Core>,
    key: String,
    rate: Option<u64>,
    client: tokio::net::TcpStream,
) -> Result<(), WeftError> {
    // The exit agent is whoever advertises the key, learned from node-info.
    let exit_agent = core
        .find_forward_exit_agent(&key)
        .ok_or_else(|| WeftError::NotFound(format!("no agent advertises forward key {:?}", key)))?;

    let (stream, handle) = core
        .open_agent_stream(exit_agent, StreamKind::Forward, key.clone().into_bytes())
        .await?;

    let buffer = core.streams.limits().buffer_size;
    match rate {
        Some(rate) => {
            let result = paced_splice(client, stream, buffer, rate, &handle).await;
            if let Err(e) = result {
                log::debug!("[FORWARD] Paced splice for {:?} ended: {}", key, e);
            }
        }
        None => {
            tokio::select! {
                _ = handle.info.cancel.cancelled() => {}
                _ = splice_counted(client, stream, buffer, &handle.info) => {}
            }
        }
    }
    Ok(())
}

/// Splice with the client-to-mesh direction paced; responses flow free.
async fn paced_splice<A, B>(
    client: A,
    mesh: B,
    buffer_size: usize,
    rate: u64,
    handle: &crate::stream::StreamHandle,
) -> std::io::Result<()>
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut mesh_read, mut mesh_write) = tokio::io::split(mesh);
    let mut pacer = Pacer::new(rate, crate::pacer::DEFAULT_BURST);

    let upstream = async {
        let mut buf = vec![0u8; buffer_size.max(1)];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            pacer.pace(n).await;
            mesh_write.write_all(&buf[..n]).await?;
            handle
                .info
                .bytes_out
                .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
        }
        mesh_write.shutdown().await
    };
    let downstream = async {
        let mut buf = vec![0u8; buffer_size.max(1)];
        loop {
            let n = mesh_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            client_write.write_all(&buf[..n]).await?;
            handle
                .info
                .bytes_in
                .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
        }
        client_write.shutdown().await
    };

    tokio::select! {
        _ = handle.info.cancel.cancelled() => Ok(()),
        result = async { tokio::try_join!(upstream, downstream) } => result.map(|_| ()),
    }
}
