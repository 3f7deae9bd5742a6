//! Fiber demultiplexing: many reliable, flow-controlled, in-order byte
//! streams over a single authenticated link.
//!
//! A [`Demux`] owns the link. Fibers are keyed by a `(local_port,
//! remote_port)` pair; well-known microservice ports sit above `1 << 17`,
//! user ports below. [`Demux::bind`] plus [`FiberListener::accept`] form the
//! passive side, [`Demux::connect`] the active one. Closing any layer
//! cancels every operation it owns with `operation_canceled`.

mod demux;
mod stream;

pub use demux::{Demux, DemuxConfig, FiberListener};
pub use stream::{Fiber, FiberReadHalf, FiberState, FiberWriteHalf};
