use crate::error::SinkError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Shared, type-erased handle to a sink.
pub type SinkRef<E> = Arc<dyn EventSink<E>>;

/// Single-use handle for a two-phase enqueue.
///
/// Not `Clone`: a key is consumed by exactly one `commit` or `abort`.
#[derive(PartialEq, Eq, Hash)]
pub struct TxKey {
    pub(crate) sink_id: u64,
    pub(crate) seq: u64,
}

impl fmt::Debug for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxKey({}:{})", self.sink_id, self.seq)
    }
}

/// Enqueue-facing side of a stage queue.
///
/// Implemented by [`FiniteQueue`](crate::io::FiniteQueue) and by adapters such
/// as [`MappedSink`].
pub trait EventSink<E: Send + 'static>: Send + Sync {
    /// Non-blocking enqueue. Fails with `Full` at capacity, `Closed` after close.
    fn enqueue(&self, event: E) -> Result<(), SinkError<E>>;

    /// Like `enqueue`, but reports failure as `false` and drops the event.
    fn enqueue_lossy(&self, event: E) -> bool {
        self.enqueue(event).is_ok()
    }

    /// All-or-nothing batch enqueue.
    fn enqueue_many(&self, events: Vec<E>) -> Result<(), SinkError<Vec<E>>>;

    /// Reserve capacity for `events` without making them visible.
    fn prepare(&self, events: Vec<E>) -> Result<TxKey, SinkError<Vec<E>>>;

    /// Publish a prepared batch at the tail, in its original order.
    fn commit(&self, key: TxKey) -> Result<(), SinkError<Vec<E>>>;

    /// Release a prepared batch; the staged events are dropped.
    fn abort(&self, key: TxKey) -> Result<(), SinkError<()>>;

    /// Visible elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` for unbounded sinks.
    fn capacity(&self) -> Option<usize>;

    fn is_closed(&self) -> bool;
}

/// Dequeue-facing side of a stage queue.
pub trait EventSource<E>: Send + Sync {
    /// Non-blocking; `None` when empty.
    fn dequeue(&self) -> Option<E>;

    /// Non-blocking; drains everything, `None` when empty.
    fn dequeue_all(&self) -> Option<Vec<E>>;

    /// Non-blocking; at most `max` elements, `None` when empty.
    fn dequeue_up_to(&self, max: usize) -> Option<Vec<E>>;

    /// Waits up to `timeout` for at least one element, then takes up to `max`
    /// (`None` = everything available) without waiting again.
    fn blocking_dequeue(&self, timeout: Duration, max: Option<usize>) -> Option<Vec<E>>;

    fn blocking_dequeue_all(&self, timeout: Duration) -> Option<Vec<E>> {
        self.blocking_dequeue(timeout, None)
    }
}

/// Adapts a sink of `T` into a sink of `E` through a conversion function.
///
/// Used to route library events (e.g. socket completions) into a stage whose
/// event type wraps them.
pub struct MappedSink<E, T: Send + 'static> {
    inner: SinkRef<T>,
    map: fn(E) -> T,
}

impl<E, T: Send + 'static> MappedSink<E, T> {
    pub fn new(inner: SinkRef<T>, map: fn(E) -> T) -> Self {
        Self { inner, map }
    }

    pub fn into_ref(self) -> SinkRef<E>
    where
        E: Send + 'static,
    {
        Arc::new(self)
    }
}

impl<E: Send + 'static, T: Send + 'static> EventSink<E> for MappedSink<E, T> {
    fn enqueue(&self, event: E) -> Result<(), SinkError<E>> {
        self.inner.enqueue((self.map)(event)).map_err(SinkError::discard)
    }

    fn enqueue_many(&self, events: Vec<E>) -> Result<(), SinkError<Vec<E>>> {
        let mapped = events.into_iter().map(self.map).collect();
        self.inner.enqueue_many(mapped).map_err(SinkError::discard)
    }

    fn prepare(&self, events: Vec<E>) -> Result<TxKey, SinkError<Vec<E>>> {
        let mapped = events.into_iter().map(self.map).collect();
        self.inner.prepare(mapped).map_err(SinkError::discard)
    }

    fn commit(&self, key: TxKey) -> Result<(), SinkError<Vec<E>>> {
        self.inner.commit(key).map_err(SinkError::discard)
    }

    fn abort(&self, key: TxKey) -> Result<(), SinkError<()>> {
        self.inner.abort(key)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn capacity(&self) -> Option<usize> {
        self.inner.capacity()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
