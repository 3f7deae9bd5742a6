//! Fiber streams: the per-fiber state, receive buffer and flow-controlled
//! write path.
//!
//! A fiber behaves like a TCP stream over the demultiplexer. Reads complete
//! from the receive buffer or park the task; writes consume send credits and
//! park when the window is empty. Credits are granted back to the peer as
//! the reader consumes bytes. All completions go through task wakeups.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use common::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio_util::sync::PollSender;

use super::demux::Shared;
use crate::datagram::{Datagram, FiberId, ProtocolId};

/// Per-fiber connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    Connecting,
    Established,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

pub(crate) struct RecvBuf {
    pub chunks: VecDeque<Bytes>,
    pub len: usize,
    /// Peer sent its FIN.
    pub eof: bool,
    /// Abort reason; set by RST, link failure or teardown.
    pub reset: Option<Error>,
    pub waker: Option<Waker>,
    /// Consumed bytes not yet granted back to the peer.
    pub pending_credits: usize,
    /// Read half dropped: arriving data is discarded but still credited.
    pub discard: bool,
}

pub(crate) struct SendState {
    pub credits: u32,
    pub wakers: Vec<Waker>,
    pub fin_sent: bool,
}

/// Configuration snapshot a fiber needs on its hot paths.
#[derive(Clone, Copy)]
pub(crate) struct FiberCfg {
    pub mtu: usize,
    pub window: u32,
    pub low_water: usize,
}

pub(crate) struct FiberShared {
    pub id: FiberId,
    pub demux: Weak<Shared>,
    pub cfg: FiberCfg,
    pub ctrl_tx: mpsc::UnboundedSender<Datagram>,
    pub data_tx: mpsc::Sender<Datagram>,
    pub state: Mutex<FiberState>,
    pub rx: Mutex<RecvBuf>,
    pub tx: Mutex<SendState>,
    pub connect_waiter: Mutex<Option<oneshot::Sender<Result<(), Error>>>>,
    pub buffered: Arc<AtomicUsize>,
    pub pull_gate: Arc<Notify>,
}

impl FiberShared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: FiberId,
        demux: Weak<Shared>,
        cfg: FiberCfg,
        ctrl_tx: mpsc::UnboundedSender<Datagram>,
        data_tx: mpsc::Sender<Datagram>,
        state: FiberState,
        initial_credits: u32,
        buffered: Arc<AtomicUsize>,
        pull_gate: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            demux,
            cfg,
            ctrl_tx,
            data_tx,
            state: Mutex::new(state),
            rx: Mutex::new(RecvBuf {
                chunks: VecDeque::new(),
                len: 0,
                eof: false,
                reset: None,
                waker: None,
                pending_credits: 0,
                discard: false,
            }),
            tx: Mutex::new(SendState {
                credits: initial_credits,
                wakers: Vec::new(),
                fin_sent: false,
            }),
            connect_waiter: Mutex::new(None),
            buffered,
            pull_gate,
        })
    }

    pub(crate) fn state(&self) -> FiberState {
        *self.state.lock().unwrap()
    }

    /// Moves every pending operation to failure and the fiber to `Closed`.
    pub(crate) fn fail(&self, err: Error) {
        *self.state.lock().unwrap() = FiberState::Closed;
        let waker = {
            let mut rx = self.rx.lock().unwrap();
            if rx.len > 0 {
                self.buffered.fetch_sub(rx.len, Ordering::AcqRel);
                self.pull_gate.notify_one();
            }
            rx.chunks.clear();
            rx.len = 0;
            rx.reset.get_or_insert(err);
            rx.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        let wakers = std::mem::take(&mut self.tx.lock().unwrap().wakers);
        for waker in wakers {
            waker.wake();
        }
        if let Some(tx) = self.connect_waiter.lock().unwrap().take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Local FIN emitted; advances the state machine and reports whether the
    /// fiber is fully closed now.
    pub(crate) fn on_local_fin(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            FiberState::Established => {
                *state = FiberState::HalfClosedLocal;
                false
            }
            FiberState::HalfClosedRemote => {
                *state = FiberState::Closed;
                true
            }
            _ => false,
        }
    }

    /// Peer FIN received; advances the state machine and reports whether the
    /// fiber is fully closed now.
    pub(crate) fn on_remote_fin(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            FiberState::Established => {
                *state = FiberState::HalfClosedRemote;
                false
            }
            FiberState::HalfClosedLocal => {
                *state = FiberState::Closed;
                true
            }
            _ => false,
        }
    }

    fn remove_from_demux(&self) {
        if let Some(demux) = self.demux.upgrade() {
            demux.remove_fiber(self.id);
        }
    }
}

/// One reliable, flow-controlled, in-order byte stream multiplexed over a
/// link. Implements [`AsyncRead`] and [`AsyncWrite`]; use
/// [`Fiber::into_split`] for concurrent reading and writing.
pub struct Fiber {
    read: FiberReadHalf,
    write: FiberWriteHalf,
}

pub struct FiberReadHalf {
    shared: Arc<FiberShared>,
}

pub struct FiberWriteHalf {
    shared: Arc<FiberShared>,
    data_tx: PollSender<Datagram>,
}

impl Fiber {
    pub(crate) fn new(shared: Arc<FiberShared>) -> Self {
        let data_tx = PollSender::new(shared.data_tx.clone());
        Self {
            read: FiberReadHalf {
                shared: shared.clone(),
            },
            write: FiberWriteHalf { shared, data_tx },
        }
    }

    pub fn id(&self) -> FiberId {
        self.read.shared.id
    }

    pub fn state(&self) -> FiberState {
        self.read.shared.state()
    }

    /// Aborts the fiber: the peer and every pending local operation fail
    /// with `operation_canceled`.
    pub fn close(&mut self) {
        abort(&self.read.shared, Error::OperationCanceled);
    }

    pub fn into_split(self) -> (FiberReadHalf, FiberWriteHalf) {
        (self.read, self.write)
    }
}

fn abort(shared: &Arc<FiberShared>, err: Error) {
    if shared.state() == FiberState::Closed {
        return;
    }
    let _ = shared.ctrl_tx.send(Datagram::control(
        ProtocolId::Rst,
        shared.id,
        err.code(),
    ));
    shared.fail(err);
    shared.remove_from_demux();
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.read.shared.id)
            .field("state", &self.read.shared.state())
            .finish()
    }
}

fn poll_read_shared(
    shared: &Arc<FiberShared>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<std::io::Result<()>> {
    let mut rx = shared.rx.lock().unwrap();
    if let Some(err) = rx.reset {
        return Poll::Ready(Err(err.into()));
    }
    if rx.chunks.is_empty() {
        if rx.eof {
            return Poll::Ready(Ok(()));
        }
        rx.waker = Some(cx.waker().clone());
        return Poll::Pending;
    }

    let mut copied = 0;
    while buf.remaining() > 0 {
        let Some(chunk) = rx.chunks.front_mut() else {
            break;
        };
        let n = chunk.len().min(buf.remaining());
        buf.put_slice(&chunk[..n]);
        copied += n;
        if n == chunk.len() {
            rx.chunks.pop_front();
        } else {
            let _ = chunk.split_to(n);
        }
    }
    rx.len -= copied;
    rx.pending_credits += copied;

    // grant credits back once half the window has been consumed
    if rx.pending_credits >= shared.cfg.window as usize / 2 {
        let granted = rx.pending_credits as u32;
        rx.pending_credits = 0;
        let _ = shared
            .ctrl_tx
            .send(Datagram::control(ProtocolId::Credit, shared.id, granted));
    }
    drop(rx);

    let before = shared.buffered.fetch_sub(copied, Ordering::AcqRel);
    if before - copied < shared.cfg.low_water {
        shared.pull_gate.notify_one();
    }
    Poll::Ready(Ok(()))
}

fn poll_write_shared(
    shared: &Arc<FiberShared>,
    data_tx: &mut PollSender<Datagram>,
    cx: &mut Context<'_>,
    buf: &[u8],
) -> Poll<std::io::Result<usize>> {
    match shared.state() {
        FiberState::Established | FiberState::HalfClosedRemote => {}
        FiberState::Closed => {
            let err = shared
                .rx
                .lock()
                .unwrap()
                .reset
                .unwrap_or(Error::BrokenPipe);
            return Poll::Ready(Err(err.into()));
        }
        _ => return Poll::Ready(Err(Error::BrokenPipe.into())),
    }
    if shared.tx.lock().unwrap().fin_sent {
        return Poll::Ready(Err(Error::BrokenPipe.into()));
    }
    if buf.is_empty() {
        return Poll::Ready(Ok(0));
    }

    // reserve the outbound lane slot first; a reserved slot survives across
    // polls, so waiting for credits below cannot lose it
    match data_tx.poll_reserve(cx) {
        Poll::Ready(Ok(())) => {}
        Poll::Ready(Err(_)) => return Poll::Ready(Err(Error::NotConnected.into())),
        Poll::Pending => return Poll::Pending,
    }

    let n = {
        let mut tx = shared.tx.lock().unwrap();
        let n = buf.len().min(shared.cfg.mtu).min(tx.credits as usize);
        if n == 0 {
            tx.wakers.push(cx.waker().clone());
            return Poll::Pending;
        }
        tx.credits -= n as u32;
        n
    };

    let datagram = Datagram::data(shared.id, Bytes::copy_from_slice(&buf[..n]));
    if data_tx.send_item(datagram).is_err() {
        return Poll::Ready(Err(Error::NotConnected.into()));
    }
    Poll::Ready(Ok(n))
}

fn poll_shutdown_shared(
    shared: &Arc<FiberShared>,
    data_tx: &mut PollSender<Datagram>,
    cx: &mut Context<'_>,
) -> Poll<std::io::Result<()>> {
    {
        let tx = shared.tx.lock().unwrap();
        if tx.fin_sent {
            return Poll::Ready(Ok(()));
        }
    }
    if shared.state() == FiberState::Closed {
        return Poll::Ready(Ok(()));
    }
    // the FIN travels on the data lane so it cannot overtake queued data
    match data_tx.poll_reserve(cx) {
        Poll::Ready(Ok(())) => {}
        Poll::Ready(Err(_)) => return Poll::Ready(Err(Error::NotConnected.into())),
        Poll::Pending => return Poll::Pending,
    }
    shared.tx.lock().unwrap().fin_sent = true;
    let fin = Datagram::control(ProtocolId::Fin, shared.id, 0);
    if data_tx.send_item(fin).is_err() {
        return Poll::Ready(Err(Error::NotConnected.into()));
    }
    if shared.on_local_fin() {
        shared.remove_from_demux();
    }
    Poll::Ready(Ok(()))
}

impl AsyncRead for FiberReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        poll_read_shared(&self.shared, cx, buf)
    }
}

impl AsyncWrite for FiberWriteHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let shared = self.shared.clone();
        poll_write_shared(&shared, &mut self.data_tx, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // datagrams are handed to the link writer as they are produced
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let shared = self.shared.clone();
        poll_shutdown_shared(&shared, &mut self.data_tx, cx)
    }
}

impl AsyncRead for Fiber {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.read).poll_read(cx, buf)
    }
}

impl AsyncWrite for Fiber {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}

impl FiberReadHalf {
    pub fn id(&self) -> FiberId {
        self.shared.id
    }
}

impl FiberWriteHalf {
    pub fn id(&self) -> FiberId {
        self.shared.id
    }
}

impl Drop for FiberReadHalf {
    fn drop(&mut self) {
        // keep crediting the peer so its writes cannot hang on a reader that
        // no longer exists
        let mut rx = self.shared.rx.lock().unwrap();
        rx.discard = true;
        if rx.len > 0 {
            self.shared.buffered.fetch_sub(rx.len, Ordering::AcqRel);
            self.shared.pull_gate.notify_one();
        }
        rx.chunks.clear();
        rx.len = 0;
    }
}

impl Drop for FiberWriteHalf {
    fn drop(&mut self) {
        let fin_needed = {
            let tx = self.shared.tx.lock().unwrap();
            !tx.fin_sent && self.shared.state() != FiberState::Closed
        };
        if fin_needed {
            self.shared.tx.lock().unwrap().fin_sent = true;
            let fin = Datagram::control(ProtocolId::Fin, self.shared.id, 0);
            // prefer the ordered data lane; fall back to the control lane if
            // the lane is saturated (the FIN may then overtake queued data)
            if let Err(mpsc::error::TrySendError::Full(fin)) = self.shared.data_tx.try_send(fin) {
                let _ = self.shared.ctrl_tx.send(fin);
            }
            if self.shared.on_local_fin() {
                self.shared.remove_from_demux();
            }
        }
    }
}
