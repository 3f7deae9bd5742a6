//! Receiver-side per-file state machine.

use common::crypto::{Hasher, Sha1Digest};

use crate::context::CopyContext;
use crate::error::ErrorCode;
use crate::msg;
use crate::packet::{Packet, PacketType};
use crate::state::StateMachine;

#[derive(Debug)]
pub enum ReceiverState {
    WaitInitRequest,
    SendInitReply(msg::InitStatus, ErrorCode),
    ReceiveFile,
    SendEof,
    WaitIntegrityCheckRequest,
    SendIntegrityCheckReply(Sha1Digest),
    AbortReceiver(ErrorCode),
    SendAbortAck(ErrorCode),
    WaitClose(ErrorCode),
}

impl ReceiverState {
    /// Inbound `Abort` from any non-terminal state: ack it, then settle.
    fn on_peer_abort(&mut self, packet: &Packet) {
        let code = packet
            .to_msg::<msg::Abort>()
            .map(|abort| abort.error_code)
            .unwrap_or(ErrorCode::Unknown);
        tracing::debug!("copy receiver: peer abort ({})", code);
        *self = ReceiverState::SendAbortAck(code);
    }
}

/// Opens the output file per the init request: truncating for a fresh
/// transfer, appending for a resume. On resume the existing bytes are fed
/// through the returned hasher so the running digest covers them.
async fn open_output(ctx: &CopyContext) -> Result<(tokio::fs::File, u64, Hasher), ErrorCode> {
    let path = ctx.output_filepath();
    let resumable = if ctx.resume {
        tokio::fs::metadata(&path).await.ok()
    } else {
        None
    };
    if let Some(metadata) = resumable {
        let existing = metadata.len();
        let mut hasher = Hasher::new();
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| ErrorCode::OutputFileNotAvailable)?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut file, &mut buf)
                .await
                .map_err(|_| ErrorCode::OutputFileNotAvailable)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|_| ErrorCode::OutputFileNotAvailable)?;
        return Ok((file, existing, hasher));
    }
    let file = tokio::fs::File::create(&path)
        .await
        .map_err(|_| ErrorCode::OutputFileNotAvailable)?;
    Ok((file, 0, Hasher::new()))
}

impl StateMachine for ReceiverState {
    fn wants_outbound(&self) -> bool {
        matches!(
            self,
            ReceiverState::SendInitReply(..)
                | ReceiverState::SendEof
                | ReceiverState::SendIntegrityCheckReply(_)
                | ReceiverState::AbortReceiver(_)
                | ReceiverState::SendAbortAck(_)
        )
    }

    async fn fill_outbound(&mut self, ctx: &mut CopyContext) -> Option<Packet> {
        match self {
            ReceiverState::SendInitReply(status, error) => {
                let status = *status;
                let error = *error;
                let reply = msg::InitReply {
                    req: msg::InitRequest {
                        input_filepath: ctx.input_filepath.to_string_lossy().into_owned(),
                        check_integrity: ctx.check_integrity,
                        stdin_input: ctx.is_stdin_input,
                        resume: ctx.resume,
                        filesize: ctx.filesize,
                        output_dir: ctx.output_dir.to_string_lossy().into_owned(),
                        output_filename: ctx.output_filename.to_string_lossy().into_owned(),
                    },
                    start_offset: ctx.start_offset,
                    current_digest: ctx
                        .output_hasher
                        .as_ref()
                        .map(|hasher| hasher.clone().finalize())
                        .unwrap_or_default(),
                    status,
                };
                *self = if status == msg::InitStatus::Succeeded {
                    ReceiverState::ReceiveFile
                } else {
                    ReceiverState::AbortReceiver(error)
                };
                Packet::from_msg(PacketType::InitReply, &reply).ok()
            }
            ReceiverState::SendEof => {
                *self = if ctx.check_integrity {
                    ReceiverState::WaitIntegrityCheckRequest
                } else {
                    ctx.error = ErrorCode::Success;
                    ReceiverState::WaitClose(ErrorCode::Success)
                };
                Some(Packet::empty(PacketType::Eof))
            }
            ReceiverState::SendIntegrityCheckReply(peer_digest) => {
                let peer_digest = *peer_digest;
                let path = ctx.output_filepath();
                let local_digest = common::crypto::file_digest(&path).await.unwrap_or_default();
                let matches = local_digest == peer_digest;
                if !matches {
                    tracing::debug!("copy receiver: digest mismatch, removing {:?}", path);
                    let _ = tokio::fs::remove_file(&path).await;
                }
                let status = if matches {
                    ctx.error = ErrorCode::Success;
                    *self = ReceiverState::WaitClose(ErrorCode::Success);
                    msg::CheckIntegrityStatus::Succeeded
                } else {
                    ctx.error = ErrorCode::OutputFileCorrupted;
                    *self = ReceiverState::WaitClose(ErrorCode::OutputFileCorrupted);
                    msg::CheckIntegrityStatus::Failed
                };
                let reply = msg::CheckIntegrityReply {
                    output_file_digest: local_digest,
                    status,
                };
                Packet::from_msg(PacketType::CheckIntegrityReply, &reply).ok()
            }
            ReceiverState::AbortReceiver(code) => {
                let code = *code;
                ctx.error = code;
                *self = ReceiverState::WaitClose(code);
                Packet::from_msg(PacketType::Abort, &msg::Abort { error_code: code }).ok()
            }
            ReceiverState::SendAbortAck(code) => {
                let code = *code;
                ctx.error = code;
                *self = ReceiverState::WaitClose(code);
                Packet::from_msg(PacketType::AbortAck, &msg::AbortAck { error_code: code }).ok()
            }
            _ => None,
        }
    }

    async fn process_inbound(&mut self, ctx: &mut CopyContext, packet: Packet) {
        if packet.packet_type == PacketType::Abort {
            if !matches!(self, ReceiverState::WaitClose(_)) {
                self.on_peer_abort(&packet);
            }
            return;
        }
        match self {
            ReceiverState::WaitInitRequest => {
                if packet.packet_type != PacketType::InitRequest {
                    *self = ReceiverState::AbortReceiver(ErrorCode::InboundPacketNotSupported);
                    return;
                }
                let Ok(req) = packet.to_msg::<msg::InitRequest>() else {
                    *self = ReceiverState::AbortReceiver(ErrorCode::InitRequestCorrupted);
                    return;
                };

                ctx.check_integrity = req.check_integrity;
                ctx.is_stdin_input = req.stdin_input;
                ctx.resume = req.resume;
                ctx.filesize = req.filesize;
                let input_path = std::path::PathBuf::from(&req.input_filepath);
                ctx.input_filepath = input_path.clone();

                // an existing directory as target means "keep the announced
                // relative name under it"
                let requested = std::path::Path::new(&req.output_dir).join(&req.output_filename);
                if tokio::fs::metadata(&requested)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false)
                {
                    ctx.output_dir = requested;
                    ctx.output_filename = input_path
                        .file_name()
                        .map(std::path::PathBuf::from)
                        .unwrap_or_default();
                } else {
                    ctx.output_dir = req.output_dir.into();
                    ctx.output_filename = req.output_filename.into();
                }

                if let Some(parent) = ctx.output_filepath().parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                let parent_ok = match ctx.output_filepath().parent() {
                    Some(parent) => tokio::fs::metadata(parent)
                        .await
                        .map(|m| m.is_dir())
                        .unwrap_or(false),
                    None => false,
                };
                if !parent_ok {
                    *self = ReceiverState::SendInitReply(
                        msg::InitStatus::Failed,
                        ErrorCode::OutputDirectoryNotFound,
                    );
                    return;
                }

                match open_output(ctx).await {
                    Ok((file, start_offset, hasher)) => {
                        ctx.output = Some(file);
                        ctx.start_offset = start_offset;
                        ctx.output_hasher = Some(hasher);
                        *self = ReceiverState::SendInitReply(
                            msg::InitStatus::Succeeded,
                            ErrorCode::Success,
                        );
                    }
                    Err(code) => {
                        *self = ReceiverState::SendInitReply(msg::InitStatus::Failed, code);
                    }
                }
            }
            ReceiverState::ReceiveFile => match packet.packet_type {
                PacketType::Data => {
                    let Some(output) = ctx.output.as_mut() else {
                        *self = ReceiverState::AbortReceiver(ErrorCode::OutputFileWriteError);
                        return;
                    };
                    if let Err(e) =
                        tokio::io::AsyncWriteExt::write_all(output, &packet.payload).await
                    {
                        tracing::debug!("copy receiver: output write failed: {}", e);
                        *self = ReceiverState::AbortReceiver(ErrorCode::OutputFileWriteError);
                        return;
                    }
                    if let Some(hasher) = ctx.output_hasher.as_mut() {
                        hasher.update(&packet.payload);
                    }
                }
                PacketType::Eof => {
                    if let Some(mut output) = ctx.output.take() {
                        let _ = tokio::io::AsyncWriteExt::flush(&mut output).await;
                        let _ = output.sync_all().await;
                    }
                    *self = ReceiverState::SendEof;
                }
                _ => {
                    *self = ReceiverState::AbortReceiver(ErrorCode::InboundPacketNotSupported);
                }
            },
            ReceiverState::WaitIntegrityCheckRequest => {
                if packet.packet_type != PacketType::CheckIntegrityRequest {
                    *self = ReceiverState::AbortReceiver(ErrorCode::InboundPacketNotSupported);
                    return;
                }
                let Ok(req) = packet.to_msg::<msg::CheckIntegrityRequest>() else {
                    *self = ReceiverState::AbortReceiver(ErrorCode::InboundPacketNotSupported);
                    return;
                };
                *self = ReceiverState::SendIntegrityCheckReply(req.input_file_digest);
            }
            _ => {
                tracing::trace!(
                    "copy receiver: ignoring {:?} in {:?}",
                    packet.packet_type,
                    self
                );
            }
        }
    }

    fn closed_code(&self) -> Option<ErrorCode> {
        match self {
            ReceiverState::WaitClose(code) => Some(*code),
            _ => None,
        }
    }
}
