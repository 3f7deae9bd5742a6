//! Authenticated link establishment.
//!
//! A link is one mutual-auth TLS byte stream between two peers. `connect`
//! walks an endpoint stack bottom-up: TCP connect, optional HTTP proxy
//! CONNECT, TLS handshake with peer verification, then the 32-bit link
//! version word. The acceptor reads the word and drops the connection on any
//! byte mismatch, before any higher-layer frame is processed.

use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Context as _;
use common::Error;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::endpoint::EndpointStack;
use crate::tls::{self, TlsParams};
use crate::version::{self, LinkVersion};
use crate::BoxedStream;

/// One authenticated TLS byte stream.
pub struct Link {
    stream: BoxedStream,
    peer: String,
}

impl Link {
    pub fn new(stream: BoxedStream, peer: String) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }

    /// TLS close-notify best effort, then drop the socket.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("link close to {}: {}", self.peer, e);
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}

impl AsyncRead for Link {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Link {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Locates the TLS layer of a stack (the first layer carrying CA material).
fn tls_layer(stack: &EndpointStack) -> anyhow::Result<TlsParams> {
    let layer = stack
        .layers
        .iter()
        .find(|layer| layer.keys().any(|k| k.starts_with("ca_")))
        .context("endpoint stack has no TLS layer")?;
    TlsParams::from_layer(layer)
}

/// Establishes an outbound authenticated link described by `stack`.
pub async fn connect(stack: &EndpointStack) -> anyhow::Result<Link> {
    let host = stack
        .find("addr")
        .ok_or(Error::DestinationAddressRequired)?
        .to_string();
    let target = stack
        .socket_addr()
        .ok_or(Error::DestinationAddressRequired)?;

    let tcp = match (stack.find("proxy_addr"), stack.find("proxy_port")) {
        (Some(proxy_addr), Some(proxy_port)) => {
            let proxy = format!("{proxy_addr}:{proxy_port}");
            tracing::debug!("connecting to {} through proxy {}", target, proxy);
            let mut tcp = TcpStream::connect(&proxy)
                .await
                .with_context(|| format!("cannot reach proxy {proxy}"))?;
            crate::proxy::connect_through(&mut tcp, &target).await?;
            tcp
        }
        _ => TcpStream::connect(&target)
            .await
            .with_context(|| format!("cannot reach {target}"))?,
    };
    tcp.set_nodelay(true)?;

    let params = tls_layer(stack)?;
    let connector = TlsConnector::from(tls::create_client_config(&params)?);
    let server_name =
        ServerName::try_from(host.clone()).with_context(|| format!("invalid host name {host}"))?;
    let mut stream = connector
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {target} failed"))?;

    version::write_word(&mut stream, LinkVersion::default().encode()).await?;
    tracing::debug!("link to {} established", target);
    Ok(Link::new(Box::new(stream), target))
}

/// Accepts inbound authenticated links on the endpoint described by `stack`.
pub struct LinkListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

pub async fn bind(stack: &EndpointStack) -> anyhow::Result<LinkListener> {
    let addr = stack
        .socket_addr()
        .ok_or(Error::DestinationAddressRequired)?;
    let params = tls_layer(stack)?;
    let acceptor = TlsAcceptor::from(tls::create_server_config(&params)?);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!("listening on {}", addr);
    Ok(LinkListener { listener, acceptor })
}

impl LinkListener {
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one TCP connection and runs the TLS handshake plus the link
    /// version check on it.
    pub async fn accept(&self) -> anyhow::Result<Link> {
        let (tcp, peer) = self.listener.accept().await?;
        tcp.set_nodelay(true)?;
        let mut stream = self
            .acceptor
            .accept(tcp)
            .await
            .with_context(|| format!("TLS handshake with {peer} failed"))?;

        let remote = LinkVersion::decode(version::read_word(&mut stream).await?);
        let local = LinkVersion::default();
        if !local.is_compatible_with(remote) {
            tracing::error!(
                "link version mismatch from {}: local {:?}, remote {:?}",
                peer,
                local,
                remote
            );
            let _ = stream.shutdown().await;
            return Err(Error::ProtocolNotSupported.into());
        }
        tracing::debug!("link from {} established", peer);
        Ok(Link::new(Box::new(stream), peer.to_string()))
    }
}

/// Wraps an arbitrary established stream as a link (used by relays and by
/// in-memory tests).
pub fn from_stream<S: crate::Stream + 'static>(stream: S, peer: &str) -> Link {
    Link::new(Box::new(stream), peer.to_string())
}
