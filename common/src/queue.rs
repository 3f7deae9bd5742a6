//! Bounded async FIFO with separate bounds on queued items and on pending
//! operations.
//!
//! The queue is the suspension primitive of the routing layer and the fiber
//! demultiplexer. Two independent limits apply: `queue_max` bounds stored
//! items, `op_max` bounds how many producers and how many consumers may be
//! suspended at once. Waiters are completed through a channel, so a
//! completion never runs in the call frame that enabled it.
//!
//! Semantics:
//! - `try_push` fails with [`Error::BufferFull`] when the item bound is hit,
//!   `try_get` with [`Error::WouldBlock`] when empty.
//! - `push`/`get` suspend at a bound and fail with [`Error::BufferFull`]
//!   when the op bound is also hit.
//! - `close` fails every pending operation with [`Error::OperationCanceled`]
//!   and drops stored items; later operations fail [`Error::BrokenPipe`].
//! - Items and waiters are both FIFO.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

struct State<T> {
    items: VecDeque<T>,
    // pending producers carry their value until capacity frees up
    push_waiters: VecDeque<(T, oneshot::Sender<Result<()>>)>,
    get_waiters: VecDeque<oneshot::Sender<Result<T>>>,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    queue_max: usize,
    op_max: usize,
}

/// Cloneable handle to a bounded async FIFO.
pub struct AsyncQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> AsyncQueue<T> {
    pub fn new(queue_max: usize, op_max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    push_waiters: VecDeque::new(),
                    get_waiters: VecDeque::new(),
                    closed: false,
                }),
                queue_max,
                op_max,
            }),
        }
    }

    /// Unbounded items, unbounded ops.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().unwrap().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Hands `value` to the first pending consumer, or stores it. The waiter
    /// wakes through its channel, outside this call frame.
    fn deliver(state: &mut State<T>, mut value: T, queue_max: usize) -> std::result::Result<(), T> {
        while let Some(waiter) = state.get_waiters.pop_front() {
            match waiter.send(Ok(value)) {
                Ok(()) => return Ok(()),
                // consumer canceled its get; try the next one
                Err(Ok(v)) => value = v,
                Err(Err(_)) => unreachable!(),
            }
        }
        if state.items.len() < queue_max {
            state.items.push_back(value);
            Ok(())
        } else {
            Err(value)
        }
    }

    pub fn try_push(&self, value: T) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(Error::BrokenPipe);
        }
        Self::deliver(&mut state, value, self.inner.queue_max).map_err(|_| Error::BufferFull)
    }

    pub async fn push(&self, value: T) -> Result<()> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(Error::BrokenPipe);
            }
            match Self::deliver(&mut state, value, self.inner.queue_max) {
                Ok(()) => return Ok(()),
                Err(value) => {
                    if state.push_waiters.len() >= self.inner.op_max {
                        return Err(Error::BufferFull);
                    }
                    let (tx, rx) = oneshot::channel();
                    state.push_waiters.push_back((value, tx));
                    rx
                }
            }
        };
        match rx.await {
            Ok(res) => res,
            // queue dropped without close(); treat as teardown
            Err(_) => Err(Error::OperationCanceled),
        }
    }

    /// Pops an item and, if a producer is suspended, promotes its value into
    /// the freed slot.
    fn take(state: &mut State<T>) -> Option<T> {
        if let Some(item) = state.items.pop_front() {
            while let Some((value, waiter)) = state.push_waiters.pop_front() {
                if waiter.send(Ok(())).is_ok() {
                    state.items.push_back(value);
                    break;
                }
                // producer canceled its push; its value never enters the queue
            }
            return Some(item);
        }
        // queue_max == 0 rendezvous: pull straight from a pending producer
        while let Some((value, waiter)) = state.push_waiters.pop_front() {
            if waiter.send(Ok(())).is_ok() {
                return Some(value);
            }
        }
        None
    }

    pub fn try_get(&self) -> Result<T> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(Error::BrokenPipe);
        }
        Self::take(&mut state).ok_or(Error::WouldBlock)
    }

    pub async fn get(&self) -> Result<T> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(Error::BrokenPipe);
            }
            if let Some(item) = Self::take(&mut state) {
                return Ok(item);
            }
            if state.get_waiters.len() >= self.inner.op_max {
                return Err(Error::BufferFull);
            }
            let (tx, rx) = oneshot::channel();
            state.get_waiters.push_back(tx);
            rx
        };
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::OperationCanceled),
        }
    }

    /// Drops all stored items. Pending operations are left untouched.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.items.clear();
    }

    /// Fails every pending operation with [`Error::OperationCanceled`], drops
    /// stored items and rejects all further operations with
    /// [`Error::BrokenPipe`].
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        state.items.clear();
        for (_, waiter) in state.push_waiters.drain(..) {
            let _ = waiter.send(Err(Error::OperationCanceled));
        }
        for waiter in state.get_waiters.drain(..) {
            let _ = waiter.send(Err(Error::OperationCanceled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = AsyncQueue::new(16, 16);
        for i in 0..10 {
            queue.push(i).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(queue.get().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_try_push_buffer_full() {
        let queue = AsyncQueue::new(2, 2);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.try_push(3), Err(Error::BufferFull));
    }

    #[tokio::test]
    async fn test_try_get_would_block() {
        let queue: AsyncQueue<u32> = AsyncQueue::new(2, 2);
        assert_eq!(queue.try_get(), Err(Error::WouldBlock));
    }

    #[tokio::test]
    async fn test_push_suspends_until_get() {
        let queue = AsyncQueue::new(1, 4);
        queue.push(1).await.unwrap();
        let q2 = queue.clone();
        let pusher = tokio::spawn(async move { q2.push(2).await });
        tokio::task::yield_now().await;
        assert_eq!(queue.get().await.unwrap(), 1);
        pusher.await.unwrap().unwrap();
        assert_eq!(queue.get().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_suspends_until_push() {
        let queue: AsyncQueue<u32> = AsyncQueue::new(4, 4);
        let q2 = queue.clone();
        let getter = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;
        queue.push(7).await.unwrap();
        assert_eq!(getter.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_op_bound_push() {
        let queue = AsyncQueue::new(1, 1);
        queue.push(1).await.unwrap();
        let q2 = queue.clone();
        let _suspended = tokio::spawn(async move { q2.push(2).await });
        tokio::task::yield_now().await;
        // op queue is full now
        assert_eq!(queue.push(3).await, Err(Error::BufferFull));
        queue.close();
    }

    #[tokio::test]
    async fn test_close_cancels_pending_and_rejects_later_ops() {
        let queue: AsyncQueue<u32> = AsyncQueue::new(4, 4);
        let q2 = queue.clone();
        let getter = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(getter.await.unwrap(), Err(Error::OperationCanceled));
        assert_eq!(queue.push(1).await, Err(Error::BrokenPipe));
        assert_eq!(queue.try_get(), Err(Error::BrokenPipe));
    }

    #[tokio::test]
    async fn test_close_cancels_pending_push() {
        let queue = AsyncQueue::new(1, 4);
        queue.push(1).await.unwrap();
        let q2 = queue.clone();
        let pusher = tokio::spawn(async move { q2.push(2).await });
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(pusher.await.unwrap(), Err(Error::OperationCanceled));
    }

    #[tokio::test]
    async fn test_clear_drops_items_only() {
        let queue = AsyncQueue::new(4, 4);
        queue.push(1).await.unwrap();
        queue.push(2).await.unwrap();
        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.is_closed());
        queue.push(3).await.unwrap();
        assert_eq!(queue.get().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_waiter_fifo() {
        let queue: AsyncQueue<u32> = AsyncQueue::new(4, 4);
        let mut getters = Vec::new();
        for _ in 0..3 {
            let q = queue.clone();
            getters.push(tokio::spawn(async move { q.get().await }));
            tokio::task::yield_now().await;
        }
        for i in 0..3 {
            queue.push(i).await.unwrap();
        }
        for (i, getter) in getters.into_iter().enumerate() {
            assert_eq!(getter.await.unwrap().unwrap(), i as u32);
        }
    }

    #[tokio::test]
    async fn test_rendezvous_queue() {
        // zero-capacity queue hands values producer-to-consumer directly
        let queue = AsyncQueue::new(0, 4);
        let q2 = queue.clone();
        let pusher = tokio::spawn(async move { q2.push(42).await });
        tokio::task::yield_now().await;
        assert_eq!(queue.get().await.unwrap(), 42);
        pusher.await.unwrap().unwrap();
    }
}
