//! HTTP proxy traversal (CONNECT method) for outbound links.

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Issues a CONNECT for `target` ("host:port") on an already-open proxy
/// connection and waits for the 2xx status line.
pub async fn connect_through(stream: &mut TcpStream, target: &str) -> anyhow::Result<()> {
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .context("cannot send CONNECT request")?;

    // read until the end of the response header block
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 16 * 1024 {
            anyhow::bail!("oversized proxy response");
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            anyhow::bail!("proxy closed the connection during CONNECT");
        }
        response.push(byte[0]);
    }

    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let _http_version = parts.next();
    let code = parts.next().unwrap_or("");
    if !code.starts_with('2') {
        anyhow::bail!("proxy refused CONNECT to {target}: {status_line}");
    }
    tracing::debug!("proxy CONNECT to {} established", target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn proxy_stub(reply: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"CONNECT "));
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_accepted() {
        let addr = proxy_stub("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        connect_through(&mut stream, "example.org:443").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let addr = proxy_stub("HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert!(connect_through(&mut stream, "example.org:443").await.is_err());
    }
}
