//! Outbound HTTP CONNECT proxy support for the TCP-based transports
//!
//! WS and H2 peers may sit behind corporate egress proxies; QUIC cannot
//! traverse one.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::TransportError;

/// Establish a TCP connection to `target`, tunneling through `proxy` with
/// optional `user:password` Basic auth when one is configured.
pub async fn connect(
    target: &str,
    proxy: Option<&str>,
    proxy_auth: Option<&str>,
) -> Result<TcpStream, TransportError> {
    match proxy {
        None => TcpStream::connect(target)
            .await
            .map_err(|e| TransportError::retryable(format!("connect {}: {}", target, e))),
        Some(proxy) => {
            let mut stream = TcpStream::connect(proxy)
                .await
                .map_err(|e| TransportError::retryable(format!("connect proxy {}: {}", proxy, e)))?;

            let mut request = format!(
                "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n",
                target = target
            );
            if let Some(auth) = proxy_auth {
                request.push_str(&format!(
                    "Proxy-Authorization: Basic {}\r\n",
                    BASE64.encode(auth.as_bytes())
                ));
            }
            request.push_str("\r\n");
            stream.write_all(request.as_bytes()).await?;

            let status = read_response_head(&mut stream).await?;
            if !(200..300).contains(&status) {
                return Err(TransportError::retryable(format!(
                    "proxy refused CONNECT: status {}",
                    status
                )));
            }
            log::debug!("[PROXY] CONNECT tunnel to {} via {}", target, proxy);
            Ok(stream)
        }
    }
}

/// Read the response headers byte-by-byte up to the blank line and return
/// the status code. Byte-wise reads avoid consuming tunneled data.
async fn read_response_head(stream: &mut TcpStream) -> Result<u16, TransportError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            return Err(TransportError::retryable("oversized proxy response"));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    let line = head
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or_default();
    let status = std::str::from_utf8(line)
        .ok()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::retryable("malformed proxy response"))?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_through_proxy() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = proxy.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = conn.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            assert!(request.starts_with("CONNECT upstream.example:443 HTTP/1.1"));
            assert!(request.contains("Proxy-Authorization: Basic"));
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
                .await
                .unwrap();
        });

        let mut stream = connect(
            "upstream.example:443",
            Some(&proxy_addr.to_string()),
            Some("user:secret"),
        )
        .await
        .unwrap();

        // Bytes after the header blank line belong to the tunnel.
        let mut tail = [0u8; 5];
        stream.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"hello");
    }

    #[tokio::test]
    async fn test_proxy_refusal() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = proxy.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let result = connect("upstream.example:443", Some(&proxy_addr.to_string()), None).await;
        assert!(result.is_err());
    }
}
