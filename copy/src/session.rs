//! Per-file session pump: drives one state machine over one fiber.
//!
//! A dedicated task reads packets off the fiber into a small channel; the
//! pump drains that channel between outbound packets, so a peer abort is
//! observed promptly even while a large file is streaming, and the read loop
//! is re-armed after every packet.

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use network::fiber::Fiber;

use crate::context::CopyContext;
use crate::error::ErrorCode;
use crate::packet::Packet;
use crate::state::StateMachine;

const INBOUND_DEPTH: usize = 8;

/// Runs one transfer to completion and returns the context with its error
/// outcome filled in.
pub async fn run_session<S: StateMachine>(
    fiber: Fiber,
    mut ctx: CopyContext,
    mut state: S,
) -> (CopyContext, ErrorCode) {
    let (mut reader, mut writer) = fiber.into_split();
    let (packet_tx, mut packet_rx) = mpsc::channel::<Packet>(INBOUND_DEPTH);
    let read_task = tokio::spawn(async move {
        loop {
            match Packet::read_from(&mut reader).await {
                Ok(Some(packet)) => {
                    if packet_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("copy session: read failed: {}", e);
                    break;
                }
            }
        }
    });

    let outcome = loop {
        if let Some(code) = state.closed_code() {
            break code;
        }
        if state.wants_outbound() {
            // see a pending peer abort before producing more data
            let mut aborted = false;
            while let Ok(packet) = packet_rx.try_recv() {
                state.process_inbound(&mut ctx, packet).await;
                if state.closed_code().is_some() || !state.wants_outbound() {
                    aborted = true;
                    break;
                }
            }
            if aborted {
                continue;
            }
            if let Some(packet) = state.fill_outbound(&mut ctx).await {
                if let Err(e) = packet.write_to(&mut writer).await {
                    tracing::debug!("copy session: write failed: {}", e);
                    break interrupt_code(&state, &ctx);
                }
            }
        } else {
            match packet_rx.recv().await {
                Some(packet) => state.process_inbound(&mut ctx, packet).await,
                None => break interrupt_code(&state, &ctx),
            }
        }
    };

    let _ = writer.shutdown().await;
    read_task.abort();
    ctx.error = outcome;
    (ctx, outcome)
}

/// A session cut short by fiber I/O failure: keep the terminal outcome if
/// one was reached, otherwise the transfer was interrupted.
fn interrupt_code<S: StateMachine>(state: &S, ctx: &CopyContext) -> ErrorCode {
    if let Some(code) = state.closed_code() {
        return code;
    }
    if ctx.error != ErrorCode::Success {
        ctx.error
    } else {
        ErrorCode::Interrupted
    }
}
