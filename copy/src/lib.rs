//! File copy microservice.
//!
//! A copy session runs between two peers already connected through a fiber
//! demultiplexer: one long-lived control fiber carries the request/ack and
//! the final notification, and one file fiber per transferred file carries a
//! small state machine (init, data, eof, optional SHA-1 integrity check,
//! abort). Transfers resume from a partial output file when the bytes the
//! receiver already holds hash to the same prefix digest, and up to
//! `max_parallel` file fibers run concurrently.

pub mod client;
pub mod context;
pub mod error;
pub mod file_acceptor;
pub mod file_sender;
pub mod msg;
pub mod packet;
pub mod server;
pub mod session;
pub mod state;

pub use error::ErrorCode;
pub use msg::CopyRequest;

use network::datagram::MICROSERVICE_PORT_MIN;

/// Well-known fiber port of the copy control channel.
pub const CONTROL_PORT: u32 = MICROSERVICE_PORT_MIN + 2;
/// Well-known fiber port of the copy file acceptor.
pub const FILE_ACCEPTOR_PORT: u32 = MICROSERVICE_PORT_MIN + 3;

/// Outcome of one copy session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopySummary {
    pub files_count: u64,
    pub errors_count: u64,
    pub error_code: ErrorCode,
}

impl CopySummary {
    pub fn failed(error_code: ErrorCode) -> Self {
        Self {
            files_count: 0,
            errors_count: 0,
            error_code,
        }
    }
}

impl std::fmt::Display for CopySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} files copied ({})",
            self.files_count - self.errors_count.min(self.files_count),
            self.files_count,
            self.error_code
        )
    }
}
