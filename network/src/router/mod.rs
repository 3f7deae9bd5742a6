//! Routing overlay for servers with multiple neighbor links.
//!
//! The router owns, per neighbor network, an outbound send queue (bounded,
//! drop-tail) and an inbound receive queue. A commutator routes every
//! datagram by prefix lookup of its destination: the local prefix delivers
//! into the destination network's receive queue, a remote prefix forwards
//! through that neighbor's link. Datagrams without a route are dropped.
//! Receive queues are lent to microservices as cloneable handles; all
//! structural changes are serialized under the router's lock.

mod table;

pub use table::{RoutingTable, LOCAL_PREFIX};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::queue::AsyncQueue;
use common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::datagram::MTU;

/// One routed unit between neighbor networks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkDatagram {
    pub dst_prefix: u32,
    pub src_prefix: u32,
    pub payload: Bytes,
}

impl NetworkDatagram {
    pub fn new(dst_prefix: u32, src_prefix: u32, payload: Bytes) -> Self {
        Self {
            dst_prefix,
            src_prefix,
            payload,
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(10 + self.payload.len());
        dst.put_u32_le(self.dst_prefix);
        dst.put_u32_le(self.src_prefix);
        dst.put_u16_le(self.payload.len() as u16);
        dst.put_slice(&self.payload);
    }

    async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Self>> {
        let mut header = [0u8; 10];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut buf = &header[..];
        let dst_prefix = buf.get_u32_le();
        let src_prefix = buf.get_u32_le();
        let len = buf.get_u16_le() as usize;
        if len > MTU {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("network datagram payload {len} exceeds MTU {MTU}"),
            ));
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(Self {
            dst_prefix,
            src_prefix,
            payload: Bytes::from(payload),
        }))
    }
}

const SEND_QUEUE_DEPTH: usize = 128;
const RECV_QUEUE_DEPTH: usize = 512;
const OP_QUEUE_DEPTH: usize = 128;

struct NetworkHandle {
    send_queue: AsyncQueue<NetworkDatagram>,
    recv_queue: AsyncQueue<NetworkDatagram>,
    pumps: Vec<tokio::task::JoinHandle<()>>,
}

struct RouterInner {
    table: RoutingTable,
    networks: Mutex<HashMap<u32, NetworkHandle>>,
    ingress: AsyncQueue<NetworkDatagram>,
}

impl RouterInner {
    /// One commutator step: prefix lookup, then local delivery or forward.
    fn route(&self, datagram: NetworkDatagram) {
        let via = match self.table.resolve(datagram.dst_prefix) {
            Ok(via) => via,
            Err(_) => {
                tracing::debug!(
                    "no route for prefix {}, datagram dropped",
                    datagram.dst_prefix
                );
                return;
            }
        };
        let networks = self.networks.lock().unwrap();
        if via == LOCAL_PREFIX {
            let Some(network) = networks.get(&datagram.dst_prefix) else {
                return;
            };
            if network.recv_queue.try_push(datagram).is_err() {
                tracing::debug!("receive queue full, datagram dropped");
            }
        } else {
            let Some(network) = networks.get(&via) else {
                tracing::debug!("next hop {} gone, datagram dropped", via);
                return;
            };
            // drop-tail: refuse new items when the send queue is full
            if network.send_queue.try_push(datagram).is_err() {
                tracing::debug!("send queue of {} full, datagram dropped", via);
            }
        }
    }
}

/// Prefix router: one per server process.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
    ingress_pump: Arc<tokio::task::JoinHandle<()>>,
}

impl Router {
    pub fn new() -> Self {
        let inner = Arc::new(RouterInner {
            table: RoutingTable::new(),
            networks: Mutex::new(HashMap::new()),
            ingress: AsyncQueue::new(SEND_QUEUE_DEPTH, OP_QUEUE_DEPTH),
        });
        let pump_inner = inner.clone();
        let ingress_pump = tokio::spawn(async move {
            while let Ok(datagram) = pump_inner.ingress.get().await {
                pump_inner.route(datagram);
            }
        });
        Self {
            inner,
            ingress_pump: Arc::new(ingress_pump),
        }
    }

    /// Attaches a neighbor network reachable over `stream`: creates its
    /// queues, starts its pumps and installs the `prefix -> local` route.
    pub fn add_network<S>(&self, prefix: u32, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if prefix == LOCAL_PREFIX {
            return Err(Error::AddressNotAvailable);
        }
        let mut networks = self.inner.networks.lock().unwrap();
        if networks.contains_key(&prefix) {
            return Err(Error::AddressInUse);
        }
        self.inner.table.add_route(prefix, LOCAL_PREFIX)?;

        let send_queue: AsyncQueue<NetworkDatagram> = AsyncQueue::new(SEND_QUEUE_DEPTH, OP_QUEUE_DEPTH);
        let recv_queue: AsyncQueue<NetworkDatagram> = AsyncQueue::new(RECV_QUEUE_DEPTH, OP_QUEUE_DEPTH);
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // outbound pump: drain the send queue onto the link
        let out_queue = send_queue.clone();
        let out_pump = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            while let Ok(datagram) = out_queue.get().await {
                buf.clear();
                datagram.encode(&mut buf);
                if let Err(e) = write_half.write_all(&buf).await {
                    tracing::debug!("neighbor write failed: {}", e);
                    out_queue.close();
                    break;
                }
            }
        });

        // inbound pump: feed arriving datagrams into the commutator
        let in_inner = self.inner.clone();
        let in_pump = tokio::spawn(async move {
            loop {
                match NetworkDatagram::read_from(&mut read_half).await {
                    Ok(Some(datagram)) => in_inner.route(datagram),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("neighbor read failed: {}", e);
                        break;
                    }
                }
            }
        });

        networks.insert(
            prefix,
            NetworkHandle {
                send_queue,
                recv_queue,
                pumps: vec![out_pump, in_pump],
            },
        );
        Ok(())
    }

    /// Detaches a neighbor: closes its queues, stops its pumps and removes
    /// every route through it.
    pub fn remove_network(&self, prefix: u32) -> Result<()> {
        let mut networks = self.inner.networks.lock().unwrap();
        let Some(handle) = networks.remove(&prefix) else {
            return Err(Error::AddressNotAvailable);
        };
        handle.send_queue.close();
        handle.recv_queue.close();
        for pump in handle.pumps {
            pump.abort();
        }
        let _ = self.inner.table.remove_route(prefix);
        self.inner.table.remove_routes_via(prefix);
        Ok(())
    }

    /// Installs a forwarding route: datagrams for `prefix` leave through the
    /// neighbor `via_prefix`.
    pub fn add_route(&self, prefix: u32, via_prefix: u32) -> Result<()> {
        self.inner.table.add_route(prefix, via_prefix)
    }

    pub fn remove_route(&self, prefix: u32) -> Result<()> {
        self.inner.table.remove_route(prefix)
    }

    /// Local receive queue of a neighbor network, lent as a handle.
    pub fn get_network_receive_queue(&self, prefix: u32) -> Result<AsyncQueue<NetworkDatagram>> {
        self.inner
            .networks
            .lock()
            .unwrap()
            .get(&prefix)
            .map(|network| network.recv_queue.clone())
            .ok_or(Error::AddressNotAvailable)
    }

    /// Queue local users push datagrams into for routing.
    pub fn get_router_send_queue(&self) -> AsyncQueue<NetworkDatagram> {
        self.inner.ingress.clone()
    }

    /// Tears the router down: every queue closes, every pump stops.
    pub fn close(&self) {
        self.inner.ingress.close();
        self.ingress_pump.abort();
        let mut networks = self.inner.networks.lock().unwrap();
        for (_, handle) in networks.drain() {
            handle.send_queue.close();
            handle.recv_queue.close();
            for pump in handle.pumps {
                pump.abort();
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_delivery() {
        let router = Router::new();
        let (side_a, _keep) = tokio::io::duplex(4096);
        router.add_network(1, side_a).unwrap();

        let send = router.get_router_send_queue();
        let recv = router.get_network_receive_queue(1).unwrap();
        send.push(NetworkDatagram::new(1, 9, Bytes::from_static(b"ping")))
            .await
            .unwrap();
        let delivered = recv.get().await.unwrap();
        assert_eq!(delivered.payload, Bytes::from_static(b"ping"));
        assert_eq!(delivered.src_prefix, 9);
        router.close();
    }

    #[tokio::test]
    async fn test_forwarding_between_neighbors() {
        let router = Router::new();
        let (net_a, mut peer_a) = tokio::io::duplex(4096);
        let (net_b, mut peer_b) = tokio::io::duplex(4096);
        router.add_network(1, net_a).unwrap();
        router.add_network(2, net_b).unwrap();
        // prefix 7 reachable through neighbor 2
        router.add_route(7, 2).unwrap();

        // a datagram arriving from neighbor 1 addressed to 7 leaves via 2
        let datagram = NetworkDatagram::new(7, 1, Bytes::from_static(b"fwd"));
        let mut buf = BytesMut::new();
        datagram.encode(&mut buf);
        peer_a.write_all(&buf).await.unwrap();

        let forwarded = NetworkDatagram::read_from(&mut peer_b)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded, datagram);
        router.close();
    }

    #[tokio::test]
    async fn test_unroutable_datagram_dropped() {
        let router = Router::new();
        let (side_a, _keep) = tokio::io::duplex(4096);
        router.add_network(1, side_a).unwrap();
        let send = router.get_router_send_queue();
        send.push(NetworkDatagram::new(42, 1, Bytes::from_static(b"lost")))
            .await
            .unwrap();
        // the routed network still works afterwards
        send.push(NetworkDatagram::new(1, 1, Bytes::from_static(b"kept")))
            .await
            .unwrap();
        let recv = router.get_network_receive_queue(1).unwrap();
        assert_eq!(recv.get().await.unwrap().payload, Bytes::from_static(b"kept"));
        router.close();
    }

    #[tokio::test]
    async fn test_duplicate_network_rejected() {
        let router = Router::new();
        let (a, _ka) = tokio::io::duplex(64);
        let (b, _kb) = tokio::io::duplex(64);
        router.add_network(1, a).unwrap();
        assert_eq!(router.add_network(1, b), Err(Error::AddressInUse));
        router.close();
    }

    #[tokio::test]
    async fn test_remove_network_drops_routes() {
        let router = Router::new();
        let (a, _ka) = tokio::io::duplex(64);
        router.add_network(1, a).unwrap();
        router.add_route(7, 1).unwrap();
        router.remove_network(1).unwrap();
        assert!(router.get_network_receive_queue(1).is_err());
        assert!(router.inner.table.is_empty());
        assert_eq!(router.remove_network(1), Err(Error::AddressNotAvailable));
        router.close();
    }
}
