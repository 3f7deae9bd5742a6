//! Shared building blocks for the SSF tools: the cross-layer error taxonomy,
//! the bounded async queue primitive and hashing helpers used by the copy
//! service.

pub mod crypto;
pub mod error;
pub mod log;
pub mod queue;
pub mod testutils;

pub use error::{Error, Result};
