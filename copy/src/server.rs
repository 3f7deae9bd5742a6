//! Copy server microservice: listens on the control and file-acceptor
//! ports of a session's demultiplexer.

use network::fiber::{Demux, Fiber};

use crate::file_acceptor::spawn_file_acceptor;
use crate::file_sender::send_files;
use crate::msg::{CopyRequest, CopyRequestAck, CopyRequestStatus};
use crate::packet::{Packet, PacketType};
use crate::{CONTROL_PORT, FILE_ACCEPTOR_PORT};

/// Copy server with its well-known ports already bound; binding eagerly
/// lets the service factory fail (or succeed) before the creation request
/// is acknowledged.
pub struct CopyServer {
    demux: Demux,
    control_listener: network::fiber::FiberListener,
    file_listener: network::fiber::FiberListener,
}

impl CopyServer {
    pub fn bind(demux: Demux) -> anyhow::Result<Self> {
        let control_listener = demux
            .bind(CONTROL_PORT)
            .map_err(|e| anyhow::anyhow!("cannot bind copy control port: {e}"))?;
        let file_listener = demux
            .bind(FILE_ACCEPTOR_PORT)
            .map_err(|e| anyhow::anyhow!("cannot bind copy file acceptor port: {e}"))?;
        Ok(Self {
            demux,
            control_listener,
            file_listener,
        })
    }

    /// Serves until the demultiplexer goes away. Incoming file fibers are
    /// received unconditionally; a control-fiber `CopyRequest` with
    /// `get_from_server` set turns this side into the sender.
    pub async fn run(self) -> anyhow::Result<()> {
        let acceptor = spawn_file_acceptor(self.file_listener);
        loop {
            match self.control_listener.accept().await {
                Ok(control) => {
                    let demux = self.demux.clone();
                    tokio::spawn(handle_control_fiber(demux, control));
                }
                Err(e) => {
                    tracing::debug!("copy control listener done: {}", e);
                    break;
                }
            }
        }
        acceptor.abort();
        Ok(())
    }
}

/// Binds and serves in one step.
pub async fn run(demux: Demux) -> anyhow::Result<()> {
    CopyServer::bind(demux)?.run().await
}

/// One control-fiber conversation: ack copy requests and, for
/// server-to-client copies, drive the file sender.
async fn handle_control_fiber(demux: Demux, control: Fiber) {
    let (mut reader, mut writer) = control.into_split();
    loop {
        let packet = match Packet::read_from(&mut reader).await {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("copy control fiber failed: {}", e);
                break;
            }
        };
        match packet.packet_type {
            PacketType::CopyRequest => {
                let decoded = packet.to_msg::<CopyRequest>();
                let (req, status) = match decoded {
                    Ok(req) => (req, CopyRequestStatus::Received),
                    Err(e) => {
                        tracing::debug!("corrupted copy request: {}", e);
                        (CopyRequest::default(), CopyRequestStatus::Corrupted)
                    }
                };
                let ack = CopyRequestAck {
                    req: req.clone(),
                    status,
                };
                let ack_packet = match Packet::from_msg(PacketType::CopyRequestAck, &ack) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::debug!("cannot encode copy request ack: {}", e);
                        break;
                    }
                };
                if ack_packet.write_to(&mut writer).await.is_err() {
                    break;
                }
                if status == CopyRequestStatus::Received && req.get_from_server {
                    tracing::info!(
                        "copy to client: {} -> {}",
                        req.input_pattern,
                        req.output_pattern
                    );
                    let summary = send_files(&demux, &mut writer, &req).await;
                    tracing::info!("copy to client finished: {}", summary);
                }
            }
            other => {
                tracing::trace!("ignoring {:?} on copy control fiber", other);
            }
        }
        // always re-arm the control read, whatever the packet was
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
}
