//! Copy client: control-fiber handshake and both transfer directions.

use anyhow::Context;
use network::fiber::{Demux, FiberReadHalf};

use crate::error::ErrorCode;
use crate::file_acceptor::spawn_file_acceptor;
use crate::file_sender::send_files;
use crate::msg::{CopyFinished, CopyRequest, CopyRequestAck, CopyRequestStatus};
use crate::packet::{Packet, PacketType};
use crate::{CopySummary, CONTROL_PORT, FILE_ACCEPTOR_PORT};

/// Connects the control fiber, sends `req` and waits for the ack.
async fn control_handshake(
    demux: &Demux,
    req: &CopyRequest,
) -> anyhow::Result<(FiberReadHalf, network::fiber::FiberWriteHalf)> {
    let control = demux
        .connect(CONTROL_PORT)
        .await
        .context("cannot connect copy control fiber")?;
    let (mut reader, mut writer) = control.into_split();

    Packet::from_msg(PacketType::CopyRequest, req)?
        .write_to(&mut writer)
        .await
        .context("cannot send copy request")?;

    let packet = Packet::read_from(&mut reader)
        .await
        .context("control fiber failed")?
        .ok_or(ErrorCode::CopyRequestAckNotReceived)
        .map_err(|code| anyhow::anyhow!("{code}"))?;
    if packet.packet_type != PacketType::CopyRequestAck {
        anyhow::bail!("unexpected {:?} instead of copy request ack", packet.packet_type);
    }
    let ack: CopyRequestAck = packet
        .to_msg()
        .context("cannot decode copy request ack")?;
    if ack.status != CopyRequestStatus::Received {
        return Err(anyhow::anyhow!("{}", ErrorCode::CopyRequestCorrupted));
    }
    Ok((reader, writer))
}

/// Pushes local files matching the request to the server.
pub async fn copy_to_server(demux: &Demux, mut req: CopyRequest) -> anyhow::Result<CopySummary> {
    req.get_from_server = false;
    let (_reader, mut writer) = control_handshake(demux, &req).await?;
    let summary = send_files(demux, &mut writer, &req).await;
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
    Ok(summary)
}

/// Asks the server to transmit its files matching the request; the local
/// side accepts the file fibers and waits for the server's `CopyFinished`.
pub async fn copy_from_server(demux: &Demux, mut req: CopyRequest) -> anyhow::Result<CopySummary> {
    req.get_from_server = true;
    // listen before the request so no file fiber can race the acceptor
    let listener = demux
        .bind(FILE_ACCEPTOR_PORT)
        .map_err(|e| anyhow::anyhow!("cannot bind file acceptor: {e}"))?;
    let acceptor = spawn_file_acceptor(listener);

    let (mut reader, writer) = control_handshake(demux, &req).await?;

    // the control fiber now carries the server's notifications
    let summary = loop {
        match Packet::read_from(&mut reader).await {
            Ok(Some(packet)) => match packet.packet_type {
                PacketType::CopyFinished => match packet.to_msg::<CopyFinished>() {
                    Ok(finished) => {
                        break CopySummary {
                            files_count: finished.files_count,
                            errors_count: finished.errors_count,
                            error_code: finished.error_code,
                        };
                    }
                    Err(e) => {
                        tracing::debug!("cannot decode copy finished notification: {}", e);
                        break CopySummary::failed(ErrorCode::Unknown);
                    }
                },
                other => {
                    tracing::trace!("ignoring {:?} on control fiber", other);
                }
            },
            Ok(None) => break CopySummary::failed(ErrorCode::CopyStopped),
            Err(e) => {
                tracing::debug!("control fiber failed: {}", e);
                break CopySummary::failed(ErrorCode::NetworkError);
            }
        }
    };

    drop(writer);
    // receiver sessions have all completed by the time the server reports
    acceptor.abort();
    Ok(summary)
}
