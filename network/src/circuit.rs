//! Circuit layer: optional chains of relays configured by the client.
//!
//! A client query carries a forward list of endpoint stacks, one per
//! remaining hop, serialized as a length-prefixed UTF-8 string. A node
//! receiving a list with more than one entry pops the next hop, opens an
//! outbound link to it, forwards the remainder and then bridges bytes in
//! both directions without framing or inspection. A single remaining entry
//! marks the receiving node as the terminus.

use anyhow::Context;
use common::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::endpoint::EndpointStack;
use crate::link::{self, Link};

/// Upper bound on a serialized forward list; anything larger is malformed.
const MAX_FORWARD_LIST_BYTES: u32 = 1024 * 1024;

pub async fn write_forward_list<S: AsyncWrite + Unpin>(
    stream: &mut S,
    hops: &[EndpointStack],
) -> anyhow::Result<()> {
    let json = serde_json::to_string(hops).context("cannot serialize forward list")?;
    let bytes = json.as_bytes();
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    Ok(())
}

pub async fn read_forward_list<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> anyhow::Result<Vec<EndpointStack>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FORWARD_LIST_BYTES {
        anyhow::bail!("forward list of {len} bytes exceeds limit");
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    let json = std::str::from_utf8(&buf).context("forward list is not UTF-8")?;
    serde_json::from_str(json).context("malformed forward list")
}

/// Builds the forward list sent on the first hop of a chain: the remaining
/// relays, the server, then the terminal marker entry.
pub fn forward_list(relays: &[EndpointStack], server: &EndpointStack) -> Vec<EndpointStack> {
    let mut hops: Vec<EndpointStack> = relays.iter().skip(1).cloned().collect();
    if !relays.is_empty() {
        hops.push(server.clone());
    }
    hops.push(EndpointStack::default());
    hops
}

/// Connects through `relays` to `server` and returns the end-to-end link.
/// With an empty relay list this is a direct connection.
pub async fn connect_chain(
    relays: &[EndpointStack],
    server: &EndpointStack,
) -> anyhow::Result<Link> {
    let first = relays.first().unwrap_or(server);
    let mut link = link::connect(first).await?;
    write_forward_list(&mut link, &forward_list(relays, server)).await?;
    Ok(link)
}

/// Outcome of the circuit stage on an accepted link.
pub enum Circuit {
    /// This node is the final destination; the upper layers take over.
    Terminus(Link),
    /// The link was bridged to the next hop until either side closed.
    Relayed,
}

/// Runs the circuit stage of an accepted link: reads the forward list and
/// either terminates here or relays to the next hop. A failure to extend the
/// circuit is answered with a 32-bit error code before closing.
pub async fn accept_circuit(
    mut link: Link,
    default_parameters: &EndpointStack,
) -> anyhow::Result<Circuit> {
    let mut hops = read_forward_list(&mut link).await?;
    if hops.len() <= 1 {
        return Ok(Circuit::Terminus(link));
    }

    let mut next = hops.remove(0);
    next.fill_defaults(default_parameters);
    let peer = next.socket_addr().unwrap_or_default();
    match extend(&next, &hops).await {
        Ok(mut next_link) => {
            tracing::debug!("relaying {} -> {}", link.peer(), peer);
            // transparent byte bridge, no inspection
            let _ = tokio::io::copy_bidirectional(&mut link, &mut next_link).await;
            link.close().await;
            next_link.close().await;
            Ok(Circuit::Relayed)
        }
        Err(e) => {
            tracing::error!("cannot extend circuit to {}: {:#}", peer, e);
            let code = e
                .downcast_ref::<Error>()
                .copied()
                .unwrap_or(Error::NotConnected)
                .code();
            let _ = link.write_all(&code.to_be_bytes()).await;
            link.close().await;
            Err(e)
        }
    }
}

async fn extend(next: &EndpointStack, remaining: &[EndpointStack]) -> anyhow::Result<Link> {
    let mut next_link = link::connect(next).await?;
    write_forward_list(&mut next_link, remaining).await?;
    Ok(next_link)
}

/// Parses one bounce-file line (`host:port`); empty lines and `#` comments
/// yield `None`.
pub fn parse_bounce_line(line: &str) -> Option<(String, u16)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (host, port) = line.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Reads relay endpoints from a bounce file, one `host:port` per line.
pub async fn read_bounce_file(path: &std::path::Path) -> anyhow::Result<Vec<EndpointStack>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read bounce file {path:?}"))?;
    Ok(contents
        .lines()
        .filter_map(parse_bounce_line)
        .map(|(host, port)| EndpointStack::tcp(&host, port))
        .collect())
}
