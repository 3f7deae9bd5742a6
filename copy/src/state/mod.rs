//! Per-file transfer state machines.
//!
//! Each side of a transfer is a tagged state with two operations: filling
//! the next outbound packet and processing one inbound packet. Transitions
//! replace the state in place; a terminal state carries the outcome.

pub mod receiver;
pub mod sender;

pub use receiver::ReceiverState;
pub use sender::SenderState;

use crate::context::CopyContext;
use crate::error::ErrorCode;
use crate::packet::Packet;

/// Common driver interface of the sender and receiver machines.
pub trait StateMachine {
    /// True when the current state has a packet to emit.
    fn wants_outbound(&self) -> bool;

    /// Produces the next outbound packet, transitioning in place. `None`
    /// means the state changed without emitting (an internal failure routed
    /// to an abort state).
    async fn fill_outbound(&mut self, ctx: &mut CopyContext) -> Option<Packet>;

    /// Processes one inbound packet, transitioning in place.
    async fn process_inbound(&mut self, ctx: &mut CopyContext, packet: Packet);

    /// Outcome of a terminal state; `None` while the transfer is running.
    fn closed_code(&self) -> Option<ErrorCode>;
}
