//! Per-thread scheduling loop.

use crate::control::stats::StageStats;
use crate::error::HandlerFault;
use crate::error_throttled;
use crate::io::base::{EventSink, EventSource};
use crate::io::queue::FiniteQueue;
use crate::model::EventHandler;
use crate::socket::Readiness;
use crate::utils::CancelToken;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const FAULT_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Readiness multiplexer a stage can be attached to, polled by the same
/// workers that drain the stage queue.
pub trait ReadinessSource: Send + Sync {
    /// Registrations currently waiting for readiness.
    fn num_active(&self) -> usize;

    /// Wait up to `timeout` for readiness, returning at most `max` results.
    fn blocking_dequeue(
        &self,
        timeout: Duration,
        max: Option<usize>,
    ) -> io::Result<Option<Vec<Readiness>>>;
}

/// Everything one worker thread needs, shared by all workers of a stage.
pub(crate) struct WorkerShared<H: EventHandler> {
    pub name: String,
    pub handler: Arc<H>,
    pub queue: Arc<FiniteQueue<H::Event>>,
    pub select: Option<Arc<dyn ReadinessSource>>,
    pub stats: Arc<StageStats>,
    /// Aggregation target, `0` drains everything.
    pub batch_target: Arc<AtomicUsize>,
    pub queue_timeout: Duration,
    pub select_timeout: Duration,
    pub select_spin: usize,
}

impl<H: EventHandler> WorkerShared<H> {
    #[inline]
    fn batch_limit(&self) -> Option<usize> {
        match self.batch_target.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    /// Worker body. Returns when `cancel` fires or the queue is closed and
    /// drained.
    pub fn run(&self, cancel: CancelToken) {
        let who = thread::current().name().unwrap_or("worker").to_owned();
        tracing::debug!("[{}] {} started", self.name, who);

        while !cancel.is_cancelled() {
            let max = self.batch_limit();

            let select = match &self.select {
                Some(select) if select.num_active() > 0 => select,
                _ => {
                    // Nothing to multiplex: park on the queue.
                    match self.queue.blocking_dequeue(self.queue_timeout, max) {
                        Some(batch) => self.dispatch_events(batch),
                        None if self.queue.is_closed() => break,
                        None => {}
                    }
                    continue;
                }
            };

            if let Some(batch) = self.queue.blocking_dequeue(Duration::ZERO, max) {
                self.dispatch_events(batch);
            }

            for _ in 0..self.select_spin.max(1) {
                if cancel.is_cancelled() {
                    break;
                }
                match select.blocking_dequeue(self.select_timeout, max) {
                    Ok(Some(ready)) => self.dispatch_readiness(ready),
                    Ok(None) => break,
                    Err(e) => {
                        error_throttled!(
                            FAULT_LOG_INTERVAL,
                            "[{}] select wait failed: {}",
                            self.name,
                            e
                        );
                        break;
                    }
                }
            }

            // Catch events that arrived while selecting.
            let drained = match max {
                Some(max) => self.queue.dequeue_up_to(max),
                None => self.queue.dequeue_all(),
            };
            if let Some(batch) = drained {
                self.dispatch_events(batch);
            }

            thread::yield_now();
        }

        tracing::debug!("[{}] {} exiting", self.name, who);
    }

    fn dispatch_events(&self, batch: Vec<H::Event>) {
        let n = batch.len();
        let start = Instant::now();
        let res = catch_unwind(AssertUnwindSafe(|| self.handler.handle_events(batch)));
        self.stats.record_batch(n, start.elapsed());
        self.settle(res);
    }

    fn dispatch_readiness(&self, ready: Vec<Readiness>) {
        let n = ready.len();
        let start = Instant::now();
        let res = catch_unwind(AssertUnwindSafe(|| self.handler.handle_readiness(ready)));
        self.stats.record_batch(n, start.elapsed());
        self.settle(res);
    }

    fn settle(&self, res: std::thread::Result<anyhow::Result<()>>) {
        let fault = match res {
            Ok(Ok(())) => return,
            Ok(Err(e)) => HandlerFault::Failed(e),
            Err(payload) => HandlerFault::from_panic(payload),
        };
        self.stats.record_fault();
        error_throttled!(
            FAULT_LOG_INTERVAL,
            "[{}] handler fault, batch dropped: {}",
            self.name,
            fault
        );
    }
}
