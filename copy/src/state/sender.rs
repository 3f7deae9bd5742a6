//! Sender-side per-file state machine.

use bytes::Bytes;

use crate::context::CopyContext;
use crate::error::ErrorCode;
use crate::msg;
use crate::packet::{Packet, PacketType, MAX_PAYLOAD_SIZE};
use crate::state::StateMachine;

#[derive(Debug)]
pub enum SenderState {
    SendInitRequest,
    WaitInitReply,
    SendFile,
    WaitEof,
    SendIntegrityCheckRequest,
    WaitIntegrityCheckReply,
    AbortSender(ErrorCode),
    WaitAbortAck(ErrorCode),
    Close(ErrorCode),
}

impl SenderState {
    /// An inbound `Abort` short-circuits every non-terminal state; the peer
    /// has already given up, no ack is owed.
    fn on_peer_abort(&mut self, packet: &Packet) {
        let code = packet
            .to_msg::<msg::Abort>()
            .map(|abort| abort.error_code)
            .unwrap_or(ErrorCode::Unknown);
        tracing::debug!("copy sender: peer abort ({})", code);
        *self = SenderState::Close(code);
    }
}

impl StateMachine for SenderState {
    fn wants_outbound(&self) -> bool {
        matches!(
            self,
            SenderState::SendInitRequest
                | SenderState::SendFile
                | SenderState::SendIntegrityCheckRequest
                | SenderState::AbortSender(_)
        )
    }

    async fn fill_outbound(&mut self, ctx: &mut CopyContext) -> Option<Packet> {
        match self {
            SenderState::SendInitRequest => {
                let req = msg::InitRequest {
                    input_filepath: ctx.input_filepath.to_string_lossy().into_owned(),
                    check_integrity: ctx.check_integrity,
                    stdin_input: ctx.is_stdin_input,
                    resume: ctx.resume,
                    filesize: ctx.filesize,
                    output_dir: ctx.output_dir.to_string_lossy().into_owned(),
                    output_filename: ctx.output_filename.to_string_lossy().into_owned(),
                };
                match Packet::from_msg(PacketType::InitRequest, &req) {
                    Ok(packet) => {
                        *self = SenderState::WaitInitReply;
                        Some(packet)
                    }
                    Err(_) => {
                        *self = SenderState::AbortSender(ErrorCode::CopyInitializationFailed);
                        None
                    }
                }
            }
            SenderState::SendFile => {
                let Some(input) = ctx.input.as_mut() else {
                    *self = SenderState::AbortSender(ErrorCode::InputFileReadError);
                    return None;
                };
                let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
                match input.read(&mut buf).await {
                    Ok(0) => {
                        *self = SenderState::WaitEof;
                        Some(Packet::empty(PacketType::Eof))
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        if let Some(hasher) = ctx.input_hasher.as_mut() {
                            hasher.update(&buf);
                        }
                        Some(Packet::new(PacketType::Data, Bytes::from(buf)))
                    }
                    Err(e) => {
                        tracing::debug!("copy sender: input read failed: {}", e);
                        *self = SenderState::AbortSender(ErrorCode::InputFileReadError);
                        None
                    }
                }
            }
            SenderState::SendIntegrityCheckRequest => {
                let digest = ctx
                    .input_hasher
                    .take()
                    .map(|hasher| hasher.finalize())
                    .unwrap_or_default();
                let req = msg::CheckIntegrityRequest {
                    input_file_digest: digest,
                };
                match Packet::from_msg(PacketType::CheckIntegrityRequest, &req) {
                    Ok(packet) => {
                        *self = SenderState::WaitIntegrityCheckReply;
                        Some(packet)
                    }
                    Err(_) => {
                        *self = SenderState::AbortSender(ErrorCode::Unknown);
                        None
                    }
                }
            }
            SenderState::AbortSender(code) => {
                let code = *code;
                let abort = msg::Abort { error_code: code };
                ctx.error = code;
                *self = SenderState::WaitAbortAck(code);
                Packet::from_msg(PacketType::Abort, &abort).ok()
            }
            _ => None,
        }
    }

    async fn process_inbound(&mut self, ctx: &mut CopyContext, packet: Packet) {
        if packet.packet_type == PacketType::Abort {
            if !matches!(self, SenderState::Close(_)) {
                self.on_peer_abort(&packet);
            }
            return;
        }
        match self {
            SenderState::WaitInitReply => {
                if packet.packet_type != PacketType::InitReply {
                    *self = SenderState::AbortSender(ErrorCode::InboundPacketNotSupported);
                    return;
                }
                let Ok(reply) = packet.to_msg::<msg::InitReply>() else {
                    *self = SenderState::AbortSender(ErrorCode::CopyInitializationFailed);
                    return;
                };
                if reply.status != msg::InitStatus::Succeeded {
                    *self = SenderState::AbortSender(ErrorCode::CopyInitializationFailed);
                    return;
                }
                ctx.start_offset = reply.start_offset;
                if let Err(e) = ctx.open_input().await {
                    tracing::debug!("copy sender: cannot open input: {}", e);
                    *self = SenderState::AbortSender(ErrorCode::InputFileReadError);
                    return;
                }
                // a resumed transfer is only legal when the bytes the
                // receiver already holds are exactly ours
                if ctx.resume && reply.start_offset > 0 {
                    let prefix_digest = ctx
                        .input_hasher
                        .as_ref()
                        .map(|hasher| hasher.clone().finalize())
                        .unwrap_or_default();
                    if prefix_digest != reply.current_digest {
                        *self =
                            SenderState::AbortSender(ErrorCode::ResumeFileTransferNotPermitted);
                        return;
                    }
                }
                *self = SenderState::SendFile;
            }
            SenderState::WaitEof => {
                if packet.packet_type != PacketType::Eof {
                    *self = SenderState::AbortSender(ErrorCode::InboundPacketNotSupported);
                    return;
                }
                if ctx.check_integrity {
                    *self = SenderState::SendIntegrityCheckRequest;
                } else {
                    ctx.error = ErrorCode::Success;
                    *self = SenderState::Close(ErrorCode::Success);
                }
            }
            SenderState::WaitIntegrityCheckReply => {
                if packet.packet_type != PacketType::CheckIntegrityReply {
                    *self = SenderState::AbortSender(ErrorCode::InboundPacketNotSupported);
                    return;
                }
                let Ok(reply) = packet.to_msg::<msg::CheckIntegrityReply>() else {
                    *self = SenderState::AbortSender(ErrorCode::OutputFileCorrupted);
                    return;
                };
                if reply.status == msg::CheckIntegrityStatus::Succeeded {
                    ctx.error = ErrorCode::Success;
                    *self = SenderState::Close(ErrorCode::Success);
                } else {
                    ctx.error = ErrorCode::OutputFileCorrupted;
                    *self = SenderState::Close(ErrorCode::OutputFileCorrupted);
                }
            }
            SenderState::WaitAbortAck(code) => {
                let code = *code;
                if packet.packet_type == PacketType::AbortAck {
                    *self = SenderState::Close(code);
                } else {
                    tracing::trace!(
                        "copy sender: ignoring {:?} while waiting for abort ack",
                        packet.packet_type
                    );
                }
            }
            SenderState::AbortSender(_) | SenderState::Close(_) => {
                tracing::trace!(
                    "copy sender: ignoring {:?} while settling",
                    packet.packet_type
                );
            }
            _ => {
                *self = SenderState::AbortSender(ErrorCode::InboundPacketNotSupported);
            }
        }
    }

    fn closed_code(&self) -> Option<ErrorCode> {
        match self {
            SenderState::Close(code) => Some(*code),
            _ => None,
        }
    }
}
