//! Admin channel: typed service requests over the reserved admin fiber.
//!
//! Messages are MessagePack maps behind a little-endian u32 length prefix,
//! carried by length-delimited framed streams. Every instantiated service
//! is tracked per session and stopped at session teardown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use network::fiber::{Demux, Fiber, FiberReadHalf, FiberWriteHalf};

use crate::registry::{Parameters, RunningService, ServiceRegistry};
use crate::ADMIN_PORT;

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AdminRequest {
    CreateService {
        service_id: u32,
        parameters: Parameters,
    },
    StopService {
        unique_id: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminStatus {
    Ok,
    Failed,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AdminReply {
    pub status: AdminStatus,
    /// Id of the created instance; echoes the request's id on stop.
    pub unique_id: u32,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec()
}

/// Framed send half for admin messages.
struct SendStream<W> {
    framed: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    fn new(stream: W) -> Self {
        Self {
            framed: FramedWrite::new(stream, codec()),
        }
    }

    async fn send_message<T: Serialize>(&mut self, msg: &T) -> anyhow::Result<()> {
        let bytes = rmp_serde::to_vec_named(msg)?;
        self.framed.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.framed.close().await?;
        Ok(())
    }
}

/// Framed receive half for admin messages.
struct RecvStream<R> {
    framed: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    fn new(stream: R) -> Self {
        Self {
            framed: FramedRead::new(stream, codec()),
        }
    }

    async fn recv_message<T: DeserializeOwned>(&mut self) -> anyhow::Result<Option<T>> {
        if let Some(frame) = self.framed.next().await {
            let bytes = frame?;
            Ok(Some(rmp_serde::from_slice(&bytes)?))
        } else {
            Ok(None)
        }
    }
}

/// Serves admin fibers on `demux` until it goes away. Each admin fiber
/// tracks the services it created and stops them when it closes.
pub async fn run_admin_server(demux: Demux, registry: Arc<ServiceRegistry>) -> anyhow::Result<()> {
    let listener = demux
        .bind(ADMIN_PORT)
        .map_err(|e| anyhow::anyhow!("cannot bind admin port: {e}"))?;
    loop {
        match listener.accept().await {
            Ok(fiber) => {
                tokio::spawn(handle_admin_fiber(demux.clone(), registry.clone(), fiber));
            }
            Err(e) => {
                tracing::debug!("admin listener done: {}", e);
                return Ok(());
            }
        }
    }
}

async fn handle_admin_fiber(demux: Demux, registry: Arc<ServiceRegistry>, fiber: Fiber) {
    let (reader, writer) = fiber.into_split();
    let mut recv = RecvStream::new(reader);
    let mut send = SendStream::new(writer);
    let mut running: HashMap<u32, RunningService> = HashMap::new();
    let mut next_unique_id = 1u32;

    loop {
        let request = match recv.recv_message::<AdminRequest>().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("admin fiber failed: {:#}", e);
                break;
            }
        };
        let reply = match request {
            AdminRequest::CreateService {
                service_id,
                parameters,
            } => match registry.create(service_id, demux.clone(), &parameters) {
                Ok(service) => {
                    let unique_id = next_unique_id;
                    next_unique_id += 1;
                    tracing::info!("service[{}] started as #{}", service_id, unique_id);
                    running.insert(unique_id, service);
                    AdminReply {
                        status: AdminStatus::Ok,
                        unique_id,
                    }
                }
                Err(e) => {
                    tracing::warn!("service[{}] creation failed: {:#}", service_id, e);
                    AdminReply {
                        status: AdminStatus::Failed,
                        unique_id: 0,
                    }
                }
            },
            AdminRequest::StopService { unique_id } => match running.remove(&unique_id) {
                Some(service) => {
                    tracing::info!(
                        "service[{}] #{} stopped",
                        service.service_id(),
                        unique_id
                    );
                    service.stop();
                    AdminReply {
                        status: AdminStatus::Ok,
                        unique_id,
                    }
                }
                None => AdminReply {
                    status: AdminStatus::Failed,
                    unique_id,
                },
            },
        };
        if send.send_message(&reply).await.is_err() {
            break;
        }
    }

    // session teardown stops everything this channel started
    for (unique_id, service) in running {
        tracing::debug!(
            "session teardown: stopping service[{}] #{}",
            service.service_id(),
            unique_id
        );
        service.stop();
    }
    let _ = send.close().await;
}

/// Client side of the admin channel.
pub struct AdminClient {
    recv: RecvStream<FiberReadHalf>,
    send: SendStream<FiberWriteHalf>,
}

impl AdminClient {
    /// Opens the admin fiber of a freshly connected session. The server
    /// binds the admin port right after the transport handshake, so a
    /// refused connect is retried briefly.
    pub async fn connect(demux: &Demux) -> anyhow::Result<Self> {
        let mut attempts = 0;
        let fiber = loop {
            match demux.connect(ADMIN_PORT).await {
                Ok(fiber) => break fiber,
                Err(common::Error::NotConnected) if attempts < 5 => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => {
                    return Err(anyhow::anyhow!(e).context("cannot connect admin fiber"));
                }
            }
        };
        let (reader, writer) = fiber.into_split();
        Ok(Self {
            recv: RecvStream::new(reader),
            send: SendStream::new(writer),
        })
    }

    async fn round_trip(&mut self, request: &AdminRequest) -> anyhow::Result<AdminReply> {
        self.send.send_message(request).await?;
        self.recv
            .recv_message()
            .await?
            .context("admin channel closed")
    }

    /// Asks the server to instantiate a service; returns its per-session
    /// unique id.
    pub async fn create_service(
        &mut self,
        service_id: u32,
        parameters: Parameters,
    ) -> anyhow::Result<u32> {
        let reply = self
            .round_trip(&AdminRequest::CreateService {
                service_id,
                parameters,
            })
            .await?;
        if reply.status != AdminStatus::Ok {
            anyhow::bail!("server refused to create service {service_id}");
        }
        Ok(reply.unique_id)
    }

    pub async fn stop_service(&mut self, unique_id: u32) -> anyhow::Result<()> {
        let reply = self
            .round_trip(&AdminRequest::StopService { unique_id })
            .await?;
        if reply.status != AdminStatus::Ok {
            anyhow::bail!("server could not stop service #{unique_id}");
        }
        Ok(())
    }
}
