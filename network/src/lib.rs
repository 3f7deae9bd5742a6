//! Networking core for the SSF tools: authenticated links, the circuit layer
//! and the fiber demultiplexer.
//!
//! # Overview
//!
//! The stack is a strict layering; each layer exposes a socket-like contract
//! to the one above and consumes the one below:
//!
//! ```text
//! Client                                Server
//!   |                                      |
//!   |  ---- TCP connect (opt. proxy) ----> |
//!   |  <--- mutual-auth TLS 1.2+ --------> |
//!   |  ---- link version word -----------> |  all four bytes must match
//!   |  ---- circuit forward list --------> |  relay pops a hop or terminates
//!   |  ---- transport version word ------> |
//!   |  <--- transport accept bool -------- |
//!   |                                      |
//!   |  <~~~ fiber datagrams ~~~~~~~~~~~~~> |  many reliable streams, one link
//! ```
//!
//! # Key components
//!
//! - [`endpoint`] - layered endpoint addresses (ordered parameter stacks)
//! - [`tls`] - rustls configuration: CA-rooted mutual authentication,
//!   PEM-file or DER-buffer material, cipher-suite selection
//! - [`link`] - connect/accept of authenticated links with version checking
//! - [`circuit`] - relay chains configured by the client and transparent to
//!   everything above
//! - [`fiber`] - the demultiplexer: reliable, flow-controlled, in-order byte
//!   streams keyed by port pairs, multiplexed over one link
//! - [`router`] - prefix-based datagram forwarding between neighbor links
//!
//! A fiber behaves like a TCP stream ([`tokio::io::AsyncRead`] /
//! [`tokio::io::AsyncWrite`]); completions are delivered through task wakeups
//! and never run inline in the call that enabled them.

pub mod circuit;
pub mod datagram;
pub mod endpoint;
pub mod fiber;
pub mod link;
pub mod proxy;
pub mod router;
pub mod tls;
pub mod version;

/// Byte stream usable underneath a link or a demultiplexer.
pub trait Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

impl<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> Stream for S {}

/// Type alias for a boxed byte stream (plain TCP, TLS or in-memory).
pub type BoxedStream = Box<dyn Stream>;
