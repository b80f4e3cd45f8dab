//! Bounded multi-producer, multi-consumer stage queue.
//!
//! One mutex and two condition variables per queue instance. Blocking calls
//! take a timeout and return early with nothing rather than blocking forever,
//! so worker threads can periodically re-check shutdown state.

use crate::error::{SinkError, SinkFailReason};
use crate::io::base::{EventSink, EventSource, TxKey};
use crate::utils::CancelToken;
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound on a single condvar wait inside `enqueue_blocking`, so the
/// cancel token is observed promptly.
const CANCEL_POLL: Duration = Duration::from_millis(50);

struct QueueState<E> {
    items: VecDeque<E>,
    /// Prepared-but-uncommitted batches, keyed by transaction sequence.
    staged: AHashMap<u64, Vec<E>>,
    /// Slots held by `staged`.
    reserved: usize,
    next_seq: u64,
    closed: bool,
    waiting_consumers: usize,
    waiting_producers: usize,
}

/// Bounded FIFO of events with two-phase enqueue and close semantics.
///
/// Invariant: `len + reserved <= capacity` while open. Once closed, every
/// enqueue fails with `Closed`, but dequeues keep draining what is left.
pub struct FiniteQueue<E> {
    id: u64,
    name: String,
    capacity: Option<usize>,
    state: Mutex<QueueState<E>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<E> fmt::Debug for FiniteQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("FiniteQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &st.items.len())
            .field("reserved", &st.reserved)
            .field("closed", &st.closed)
            .finish()
    }
}

impl<E: Send + 'static> FiniteQueue<E> {
    /// Create a queue; `capacity == None` means unbounded.
    pub fn new(name: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            capacity: capacity.filter(|c| *c > 0),
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.unwrap_or(16).min(4096)),
                staged: AHashMap::new(),
                reserved: 0,
                next_seq: 1,
                closed: false,
                waiting_consumers: 0,
                waiting_producers: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Create a queue from a signed threshold where `<= 0` means unbounded.
    pub fn with_threshold(name: impl Into<String>, threshold: i64) -> Self {
        let capacity = usize::try_from(threshold).ok().filter(|c| *c > 0);
        Self::new(name, capacity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slots held by prepared transactions.
    pub fn reserved(&self) -> usize {
        self.state.lock().reserved
    }

    /// Transition to CLOSED and wake every blocked producer and consumer.
    pub fn close(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        drop(st);
        self.not_empty.notify_all();
        self.not_full.notify_all();
        tracing::debug!("[{}] queue closed", self.name);
    }

    /// Enqueue, waiting for space while the queue is full.
    ///
    /// Gives up with `Closed`, `Cancelled` or `Timeout`; `timeout == None`
    /// waits until space frees, the queue closes or `cancel` fires.
    pub fn enqueue_blocking(
        &self,
        event: E,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SinkError<E>> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut st = self.state.lock();

        loop {
            if st.closed {
                return Err(SinkError::closed(Some(event)));
            }
            if self.has_room(&st, 1) {
                st.items.push_back(event);
                self.wake_consumers(&st, 1);
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(SinkError::cancelled(Some(event)));
            }

            let mut slice = CANCEL_POLL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(SinkError::timeout(Some(event)));
                }
                slice = slice.min(deadline - now);
            }

            st.waiting_producers += 1;
            self.not_full.wait_for(&mut st, slice);
            st.waiting_producers -= 1;
        }
    }

    #[inline]
    fn has_room(&self, st: &QueueState<E>, incoming: usize) -> bool {
        match self.capacity {
            Some(cap) => st.items.len() + st.reserved + incoming <= cap,
            None => true,
        }
    }

    /// Wake only as many blocked consumers as there are new elements.
    #[inline]
    fn wake_consumers(&self, st: &QueueState<E>, added: usize) {
        for _ in 0..added.min(st.waiting_consumers) {
            self.not_empty.notify_one();
        }
    }

    #[inline]
    fn wake_producers(&self, st: &QueueState<E>, freed: usize) {
        for _ in 0..freed.min(st.waiting_producers) {
            self.not_full.notify_one();
        }
    }

    fn take(&self, st: &mut MutexGuard<'_, QueueState<E>>, max: Option<usize>) -> Option<Vec<E>> {
        if st.items.is_empty() || max == Some(0) {
            return None;
        }
        let n = max.map_or(st.items.len(), |m| m.min(st.items.len()));
        let batch: Vec<E> = st.items.drain(..n).collect();
        self.wake_producers(st, batch.len());
        Some(batch)
    }

    fn check_key(&self, key: &TxKey) -> bool {
        key.sink_id == self.id
    }
}

impl<E: Send + 'static> EventSink<E> for FiniteQueue<E> {
    fn enqueue(&self, event: E) -> Result<(), SinkError<E>> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(SinkError::closed(Some(event)));
        }
        if !self.has_room(&st, 1) {
            return Err(SinkError::full(Some(event)));
        }
        st.items.push_back(event);
        self.wake_consumers(&st, 1);
        Ok(())
    }

    fn enqueue_many(&self, events: Vec<E>) -> Result<(), SinkError<Vec<E>>> {
        if events.is_empty() {
            return Ok(());
        }
        let mut st = self.state.lock();
        if st.closed {
            return Err(SinkError::closed(Some(events)));
        }
        if !self.has_room(&st, events.len()) {
            return Err(SinkError::full(Some(events)));
        }
        let added = events.len();
        st.items.extend(events);
        self.wake_consumers(&st, added);
        Ok(())
    }

    fn prepare(&self, events: Vec<E>) -> Result<TxKey, SinkError<Vec<E>>> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(SinkError::closed(Some(events)));
        }
        if !self.has_room(&st, events.len()) {
            return Err(SinkError::full(Some(events)));
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        st.reserved += events.len();
        st.staged.insert(seq, events);
        Ok(TxKey {
            sink_id: self.id,
            seq,
        })
    }

    fn commit(&self, key: TxKey) -> Result<(), SinkError<Vec<E>>> {
        if !self.check_key(&key) {
            return Err(SinkError::unknown_key());
        }
        let mut st = self.state.lock();
        let Some(events) = st.staged.remove(&key.seq) else {
            return Err(SinkError::unknown_key());
        };
        st.reserved -= events.len();

        if st.closed {
            return Err(SinkError {
                value: Some(events),
                reason: SinkFailReason::Closed,
            });
        }

        let added = events.len();
        st.items.extend(events);
        self.wake_consumers(&st, added);
        Ok(())
    }

    fn abort(&self, key: TxKey) -> Result<(), SinkError<()>> {
        if !self.check_key(&key) {
            return Err(SinkError::unknown_key());
        }
        let mut st = self.state.lock();
        let Some(events) = st.staged.remove(&key.seq) else {
            return Err(SinkError::unknown_key());
        };
        st.reserved -= events.len();
        self.wake_producers(&st, events.len());
        Ok(())
    }

    fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<E: Send + 'static> EventSource<E> for FiniteQueue<E> {
    fn dequeue(&self) -> Option<E> {
        let mut st = self.state.lock();
        let event = st.items.pop_front();
        if event.is_some() {
            self.wake_producers(&st, 1);
        }
        event
    }

    fn dequeue_all(&self) -> Option<Vec<E>> {
        let mut st = self.state.lock();
        self.take(&mut st, None)
    }

    fn dequeue_up_to(&self, max: usize) -> Option<Vec<E>> {
        let mut st = self.state.lock();
        self.take(&mut st, Some(max))
    }

    /// Waits up to `timeout` for the first element only. Once at least one
    /// element is present it takes up to `max` of whatever is available and
    /// returns immediately; there is no second timed wait to fill the batch.
    /// This trades batch size for latency on purpose.
    fn blocking_dequeue(&self, timeout: Duration, max: Option<usize>) -> Option<Vec<E>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut st = self.state.lock();

        while st.items.is_empty() {
            if st.closed || timeout.is_zero() {
                return None;
            }
            st.waiting_consumers += 1;
            let timed_out = match deadline {
                Some(deadline) => self.not_empty.wait_until(&mut st, deadline).timed_out(),
                None => {
                    self.not_empty.wait(&mut st);
                    false
                }
            };
            st.waiting_consumers -= 1;
            if timed_out {
                break;
            }
        }

        self.take(&mut st, max)
    }
}
