//! Receiver-side acceptor: one receiver session per incoming file fiber.

use network::fiber::FiberListener;

use crate::context::CopyContext;
use crate::session;
use crate::state::ReceiverState;

/// Accepts file fibers until the listener closes; each fiber runs one
/// receiver state machine to completion.
pub fn spawn_file_acceptor(listener: FiberListener) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let fiber = match listener.accept().await {
                Ok(fiber) => fiber,
                Err(e) => {
                    tracing::debug!("file acceptor done: {}", e);
                    break;
                }
            };
            tokio::spawn(async move {
                let ctx = CopyContext::for_receiver();
                let (ctx, code) =
                    session::run_session(fiber, ctx, ReceiverState::WaitInitRequest).await;
                if code.is_success() {
                    tracing::info!("received {:?}", ctx.output_filepath());
                } else {
                    tracing::warn!("receive of {:?} failed: {}", ctx.output_filepath(), code);
                }
            });
        }
    })
}
