//! The fiber demultiplexer: one reader and one writer task per link, a fiber
//! table and listener queues.
//!
//! The writer task is the link's strand: control datagrams (SYN, SYN-ACK,
//! RST, credit grants) take a priority lane, data and FIN share the ordered
//! bounded lane. The reader task pulls datagrams off the link into per-fiber
//! receive buffers; it pauses when the total buffered bytes pass the high
//! watermark and resumes below the low watermark. A link failure fails every
//! fiber with the same error and notifies the demultiplexer's owner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use common::queue::AsyncQueue;
use common::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify};

use super::stream::{Fiber, FiberCfg, FiberShared, FiberState};
use crate::datagram::{self, Datagram, FiberId, ProtocolId};

/// Tuning knobs of one demultiplexer.
#[derive(Clone, Copy, Debug)]
pub struct DemuxConfig {
    /// Maximum data payload per datagram; capped by the link MTU.
    pub mtu: usize,
    /// Per-fiber receive window advertised to the peer.
    pub window: u32,
    /// Pause pulling from the link above this many buffered bytes.
    pub high_water: usize,
    /// Resume pulling below this many buffered bytes.
    pub low_water: usize,
    /// Listener backlog (pending accepted fibers and pending accept calls).
    pub backlog: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            mtu: datagram::MTU,
            window: 256 * 1024,
            high_water: 16 * 1024 * 1024,
            low_water: 1024 * 1024,
            backlog: 128,
        }
    }
}

const DATA_LANE_DEPTH: usize = 64;

pub(crate) struct Shared {
    pub config: DemuxConfig,
    pub fibers: Mutex<HashMap<FiberId, Arc<FiberShared>>>,
    pub listeners: Mutex<HashMap<u32, AsyncQueue<Fiber>>>,
    pub ctrl_tx: mpsc::UnboundedSender<Datagram>,
    pub data_tx: mpsc::Sender<Datagram>,
    next_port: AtomicU32,
    pub buffered: Arc<AtomicUsize>,
    pub pull_gate: Arc<Notify>,
    closed: Mutex<Option<Error>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn remove_fiber(&self, id: FiberId) {
        self.fibers.lock().unwrap().remove(&id);
    }

    fn fiber(&self, id: FiberId) -> Option<Arc<FiberShared>> {
        self.fibers.lock().unwrap().get(&id).cloned()
    }

    fn is_closed(&self) -> bool {
        self.closed.lock().unwrap().is_some()
    }

    fn cfg(&self) -> FiberCfg {
        FiberCfg {
            mtu: self.config.mtu.min(datagram::MTU),
            window: self.config.window,
            low_water: self.config.low_water,
        }
    }

    /// Allocates an unused ephemeral local port for a connect to
    /// `remote_port`. User ports live below the well-known range.
    fn alloc_local_port(&self, remote_port: u32) -> Result<u32, Error> {
        let fibers = self.fibers.lock().unwrap();
        for _ in 0..datagram::MICROSERVICE_PORT_MIN {
            let mut port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if port >= datagram::MICROSERVICE_PORT_MIN {
                self.next_port.store(1, Ordering::Relaxed);
                port = 1;
            }
            if !fibers.contains_key(&FiberId::new(port, remote_port)) {
                return Ok(port);
            }
        }
        Err(Error::AddressInUse)
    }
}

/// Teardown: fails every fiber, closes every listener, wakes the owner.
/// Idempotent; the first error wins.
fn teardown(shared: &Arc<Shared>, err: Error) {
    {
        let mut closed = shared.closed.lock().unwrap();
        if closed.is_some() {
            return;
        }
        *closed = Some(err);
    }
    tracing::debug!("demux teardown: {}", err);
    let listeners: Vec<_> = shared.listeners.lock().unwrap().drain().collect();
    for (_, queue) in listeners {
        queue.close();
    }
    let fibers: Vec<_> = shared.fibers.lock().unwrap().drain().collect();
    for (_, fiber) in fibers {
        fiber.fail(err);
    }
    let _ = shared.shutdown_tx.send(true);
}

/// The fiber demultiplexer over one authenticated link.
///
/// Cloning hands out another handle onto the same demultiplexer.
#[derive(Clone)]
pub struct Demux {
    shared: Arc<Shared>,
}

impl Demux {
    pub fn new<S>(link: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(link, DemuxConfig::default())
    }

    pub fn with_config<S>(link: S, config: DemuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(DATA_LANE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            fibers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            ctrl_tx,
            data_tx,
            next_port: AtomicU32::new(1),
            buffered: Arc::new(AtomicUsize::new(0)),
            pull_gate: Arc::new(Notify::new()),
            closed: Mutex::new(None),
            shutdown_tx,
        });

        let (read_half, write_half) = tokio::io::split(link);
        tokio::spawn(reader_loop(shared.clone(), read_half, shutdown_rx.clone()));
        tokio::spawn(writer_loop(
            shared.clone(),
            write_half,
            ctrl_rx,
            data_rx,
            shutdown_rx,
        ));
        Self { shared }
    }

    /// Opens a fiber to a port the peer listens on. Resolves once the peer
    /// accepted, or fails with `not_connected`.
    pub async fn connect(&self, remote_port: u32) -> Result<Fiber, Error> {
        if self.shared.is_closed() {
            return Err(Error::BrokenPipe);
        }
        let local_port = self.shared.alloc_local_port(remote_port)?;
        let id = FiberId::new(local_port, remote_port);
        let shared_fiber = FiberShared::new(
            id,
            Arc::downgrade(&self.shared),
            self.shared.cfg(),
            self.shared.ctrl_tx.clone(),
            self.shared.data_tx.clone(),
            FiberState::Connecting,
            0,
            self.shared.buffered.clone(),
            self.shared.pull_gate.clone(),
        );
        let (tx, rx) = oneshot::channel();
        *shared_fiber.connect_waiter.lock().unwrap() = Some(tx);
        self.shared
            .fibers
            .lock()
            .unwrap()
            .insert(id, shared_fiber.clone());
        // teardown may have drained the table while we were inserting
        if self.shared.is_closed() {
            self.shared.remove_fiber(id);
            return Err(Error::BrokenPipe);
        }

        let syn = Datagram::control(ProtocolId::Syn, id, self.shared.config.window);
        if self.shared.ctrl_tx.send(syn).is_err() {
            self.shared.remove_fiber(id);
            return Err(Error::NotConnected);
        }
        match rx.await {
            Ok(Ok(())) => Ok(Fiber::new(shared_fiber)),
            Ok(Err(e)) => {
                self.shared.remove_fiber(id);
                Err(e)
            }
            Err(_) => Err(Error::OperationCanceled),
        }
    }

    /// Binds a listener on a local port; incoming fibers queue up for
    /// [`FiberListener::accept`]. Fails with `address_in_use` on a duplicate
    /// port.
    pub fn bind(&self, local_port: u32) -> Result<FiberListener, Error> {
        if self.shared.is_closed() {
            return Err(Error::BrokenPipe);
        }
        let mut listeners = self.shared.listeners.lock().unwrap();
        if listeners.contains_key(&local_port) {
            return Err(Error::AddressInUse);
        }
        let queue = AsyncQueue::new(self.shared.config.backlog, self.shared.config.backlog);
        listeners.insert(local_port, queue.clone());
        drop(listeners);
        if self.shared.is_closed() {
            self.shared.listeners.lock().unwrap().remove(&local_port);
            queue.close();
            return Err(Error::BrokenPipe);
        }
        Ok(FiberListener {
            port: local_port,
            queue,
            demux: Arc::downgrade(&self.shared),
        })
    }

    /// Tears the demultiplexer down: every fiber and listener operation
    /// fails with `operation_canceled` and the link is shut down.
    pub fn close(&self) {
        teardown(&self.shared, Error::OperationCanceled);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Waits for teardown and returns its reason.
    pub async fn closed(&self) -> Error {
        let mut rx = self.shared.shutdown_tx.subscribe();
        loop {
            if let Some(err) = *self.shared.closed.lock().unwrap() {
                return err;
            }
            if rx.changed().await.is_err() {
                return Error::OperationCanceled;
            }
        }
    }
}

/// Accepting side of a bound fiber port.
pub struct FiberListener {
    port: u32,
    queue: AsyncQueue<Fiber>,
    demux: Weak<Shared>,
}

impl FiberListener {
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Waits for the next incoming fiber on this port.
    pub async fn accept(&self) -> Result<Fiber, Error> {
        self.queue.get().await
    }

    /// Stops accepting; pending accepts fail with `operation_canceled`.
    pub fn close(&self) {
        self.queue.close();
        if let Some(demux) = self.demux.upgrade() {
            demux.listeners.lock().unwrap().remove(&self.port);
        }
    }
}

impl Drop for FiberListener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn writer_loop<W: AsyncWrite + Unpin>(
    shared: Arc<Shared>,
    mut link: W,
    mut ctrl_rx: mpsc::UnboundedReceiver<Datagram>,
    mut data_rx: mpsc::Receiver<Datagram>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let datagram = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            d = ctrl_rx.recv() => d,
            d = data_rx.recv() => d,
        };
        let Some(datagram) = datagram else { break };
        if let Err(e) = datagram.write_to(&mut link).await {
            tracing::debug!("link write failed: {}", e);
            teardown(&shared, Error::NotConnected);
            break;
        }
    }
    let _ = link.shutdown().await;
}

async fn reader_loop<R: AsyncRead + Unpin>(
    shared: Arc<Shared>,
    mut link: R,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let err = 'outer: loop {
        // watermark gate: once above high, wait until consumption drops the
        // buffer below low
        if shared.buffered.load(Ordering::Acquire) >= shared.config.high_water {
            loop {
                let notified = shared.pull_gate.notified();
                if shared.buffered.load(Ordering::Acquire) < shared.config.low_water {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break 'outer Error::OperationCanceled,
                    _ = notified => {}
                }
            }
        }
        let datagram = tokio::select! {
            _ = shutdown_rx.changed() => break Error::OperationCanceled,
            d = Datagram::read_from(&mut link) => d,
        };
        match datagram {
            Ok(Some(datagram)) => dispatch(&shared, datagram),
            Ok(None) => break Error::NotConnected,
            Err(e) => {
                tracing::debug!("link read failed: {}", e);
                break Error::NotConnected;
            }
        }
    };
    teardown(&shared, err);
}

/// Routes one inbound datagram to its fiber or listener.
fn dispatch(shared: &Arc<Shared>, datagram: Datagram) {
    let id = datagram.id;
    match datagram.protocol {
        ProtocolId::Syn => on_syn(shared, &datagram),
        ProtocolId::SynAck => {
            let Some(fiber) = shared.fiber(id) else {
                return;
            };
            let peer_window = datagram.control_arg().unwrap_or(0);
            {
                let mut state = fiber.state.lock().unwrap();
                if *state != FiberState::Connecting {
                    return;
                }
                *state = FiberState::Established;
            }
            fiber.tx.lock().unwrap().credits = peer_window;
            if let Some(tx) = fiber.connect_waiter.lock().unwrap().take() {
                let _ = tx.send(Ok(()));
            }
        }
        ProtocolId::Data => {
            let Some(fiber) = shared.fiber(id) else {
                tracing::trace!("data for unknown fiber {}, dropped", id);
                return;
            };
            let len = datagram.payload.len();
            let waker = {
                let mut rx = fiber.rx.lock().unwrap();
                if rx.reset.is_some() || rx.eof {
                    return;
                }
                if rx.discard {
                    // no reader left; credit the peer straight back
                    let _ = shared.ctrl_tx.send(Datagram::control(
                        ProtocolId::Credit,
                        id,
                        len as u32,
                    ));
                    return;
                }
                rx.chunks.push_back(datagram.payload);
                rx.len += len;
                rx.waker.take()
            };
            shared.buffered.fetch_add(len, Ordering::AcqRel);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
        ProtocolId::Credit => {
            let Some(fiber) = shared.fiber(id) else {
                return;
            };
            let granted = datagram.control_arg().unwrap_or(0);
            let wakers = {
                let mut tx = fiber.tx.lock().unwrap();
                tx.credits = tx.credits.saturating_add(granted);
                std::mem::take(&mut tx.wakers)
            };
            for waker in wakers {
                waker.wake();
            }
        }
        ProtocolId::Fin => {
            let Some(fiber) = shared.fiber(id) else {
                return;
            };
            let waker = {
                let mut rx = fiber.rx.lock().unwrap();
                rx.eof = true;
                rx.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
            if fiber.on_remote_fin() {
                shared.remove_fiber(id);
            }
        }
        ProtocolId::Rst => {
            let Some(fiber) = shared.fiber(id) else {
                return;
            };
            let reason = datagram
                .control_arg()
                .map(Error::from_code)
                .unwrap_or(Error::NotConnected);
            let reason = if fiber.state() == FiberState::Connecting {
                Error::NotConnected
            } else {
                reason
            };
            fiber.fail(reason);
            shared.remove_fiber(id);
        }
    }
}

fn on_syn(shared: &Arc<Shared>, datagram: &Datagram) {
    let id = datagram.id;
    let peer_window = datagram.control_arg().unwrap_or(0);
    let listener = shared.listeners.lock().unwrap().get(&id.local_port).cloned();
    let Some(listener) = listener else {
        tracing::debug!("no listener on fiber port {}, refusing", id.local_port);
        let refused = Datagram::control(ProtocolId::Rst, id, Error::ConnectionRefused.code());
        let _ = shared.ctrl_tx.send(refused);
        return;
    };
    let fiber = {
        let mut fibers = shared.fibers.lock().unwrap();
        if fibers.contains_key(&id) {
            let dup = Datagram::control(ProtocolId::Rst, id, Error::AddressInUse.code());
            let _ = shared.ctrl_tx.send(dup);
            return;
        }
        let fiber = FiberShared::new(
            id,
            Arc::downgrade(shared),
            shared.cfg(),
            shared.ctrl_tx.clone(),
            shared.data_tx.clone(),
            FiberState::Established,
            peer_window,
            shared.buffered.clone(),
            shared.pull_gate.clone(),
        );
        fibers.insert(id, fiber.clone());
        fiber
    };
    if listener.try_push(Fiber::new(fiber)).is_err() {
        tracing::debug!(
            "listener backlog full on port {}, refusing fiber",
            id.local_port
        );
        shared.remove_fiber(id);
        let rst = Datagram::control(ProtocolId::Rst, id, Error::BufferFull.code());
        let _ = shared.ctrl_tx.send(rst);
        return;
    }
    let ack = Datagram::control(ProtocolId::SynAck, id, shared.config.window);
    let _ = shared.ctrl_tx.send(ack);
}
