use crate::control::inputs::ControllerInputs;
use crate::control::policy::Policy;
use crate::control::stats::StageStats;
use crate::io::base::EventSink;
use crate::io::queue::FiniteQueue;
use crate::utils::CancelToken;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Starts one worker thread bound to the given cancel token.
pub(crate) type Spawner = Arc<dyn Fn(CancelToken, usize) -> io::Result<JoinHandle<()>> + Send + Sync>;

/// Queue occupancy as seen by the controller.
pub trait Occupancy: Send + Sync {
    fn occupancy(&self) -> (usize, Option<usize>);
}

impl<E: Send + 'static> Occupancy for FiniteQueue<E> {
    fn occupancy(&self) -> (usize, Option<usize>) {
        (self.len(), self.capacity())
    }
}

struct Worker {
    cancel: CancelToken,
    join: JoinHandle<()>,
}

/// Worker threads of one stage plus the controller that resizes them.
pub struct ThreadPool {
    name: String,
    cancel: CancelToken,
    spawner: Spawner,
    min_threads: usize,
    max_threads: usize,
    workers: Mutex<Vec<Worker>>,
    /// Cancelled workers finishing their last batch.
    retired: Mutex<Vec<JoinHandle<()>>>,
    controller: Mutex<Option<JoinHandle<()>>>,
    next_idx: AtomicUsize,
    batch_target: Arc<AtomicUsize>,
}

impl ThreadPool {
    pub(crate) fn new(
        name: impl Into<String>,
        cancel: CancelToken,
        spawner: Spawner,
        min_threads: usize,
        max_threads: usize,
        batch_target: Arc<AtomicUsize>,
    ) -> Self {
        let min_threads = min_threads.max(1);
        Self {
            name: name.into(),
            cancel,
            spawner,
            min_threads,
            max_threads: max_threads.max(min_threads),
            workers: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            controller: Mutex::new(None),
            next_idx: AtomicUsize::new(0),
            batch_target,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live workers.
    pub fn num_threads(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn batch_target(&self) -> Option<usize> {
        match self.batch_target.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn set_batch_target(&self, target: Option<usize>) {
        self.batch_target
            .store(target.unwrap_or(0), Ordering::Relaxed);
    }

    /// Spawn `n` workers, stopping at `max_threads`.
    pub(crate) fn start(&self, n: usize) -> io::Result<()> {
        for _ in 0..n.clamp(self.min_threads, self.max_threads) {
            self.add_worker()?;
        }
        Ok(())
    }

    /// Returns `Ok(false)` when already at `max_threads`.
    pub fn add_worker(&self) -> io::Result<bool> {
        let mut workers = self.workers.lock();
        if workers.len() >= self.max_threads || self.cancel.is_cancelled() {
            return Ok(false);
        }
        let cancel = self.cancel.new_child();
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed);
        let join = (self.spawner)(cancel.clone(), idx)?;
        workers.push(Worker { cancel, join });
        Ok(true)
    }

    /// Retire the newest worker after its current batch. Returns `false`
    /// when already at `min_threads`.
    pub fn remove_worker(&self) -> bool {
        let mut workers = self.workers.lock();
        if workers.len() <= self.min_threads {
            return false;
        }
        let Some(worker) = workers.pop() else {
            return false;
        };
        drop(workers);
        worker.cancel.cancel();
        let mut retired = self.retired.lock();
        retired.retain(|j| !j.is_finished());
        retired.push(worker.join);
        true
    }

    /// Start the periodic controller thread.
    pub(crate) fn spawn_controller(
        self: &Arc<Self>,
        mut policy: Box<dyn Policy>,
        interval: Duration,
        stats: Arc<StageStats>,
        load: Arc<dyn Occupancy>,
    ) -> io::Result<()> {
        let pool = self.clone();
        let cancel = self.cancel.new_child();
        let join = thread::Builder::new()
            .name(format!("{}-ctl", self.name))
            .spawn(move || {
                while cancel.sleep_cancellable(interval) {
                    if let Some(p90) = stats.latency_percentile(0.9) {
                        stats.record_90th_rt(p90);
                    }
                    let (queue_len, queue_capacity) = load.occupancy();
                    let inputs = ControllerInputs {
                        service_rate: stats.service_rate(),
                        rt90_ms: stats.get_90th_rt(),
                        queue_len,
                        queue_capacity,
                        threads: pool.num_threads(),
                        batch_target: pool.batch_target(),
                    };
                    let decision = policy.decide(&inputs);
                    pool.apply(&inputs, decision.thread_delta, decision.batch_target);
                }
            })?;
        *self.controller.lock() = Some(join);
        Ok(())
    }

    fn apply(&self, inputs: &ControllerInputs, thread_delta: i8, batch_target: Option<usize>) {
        if thread_delta > 0 {
            match self.add_worker() {
                Ok(true) => tracing::info!(
                    "[{}] +1 worker ({} threads, queue {}, {:.1} ev/s)",
                    self.name,
                    self.num_threads(),
                    inputs.queue_len,
                    inputs.service_rate
                ),
                Ok(false) => {}
                Err(e) => tracing::error!("[{}] cannot spawn worker: {}", self.name, e),
            }
        } else if thread_delta < 0 && self.remove_worker() {
            tracing::info!(
                "[{}] -1 worker ({} threads, queue {})",
                self.name,
                self.num_threads(),
                inputs.queue_len
            );
        }

        if batch_target != inputs.batch_target {
            tracing::debug!(
                "[{}] batch target {:?} -> {:?} (p90 {:.2}ms)",
                self.name,
                inputs.batch_target,
                batch_target,
                inputs.rt90_ms
            );
            self.set_batch_target(batch_target);
        }
    }

    /// Cancel every thread and wait up to `grace` for them to exit. Threads
    /// still running after that are detached. Returns how many were detached.
    pub(crate) fn shutdown(&self, grace: Duration) -> usize {
        self.cancel.cancel();

        let mut joins: Vec<JoinHandle<()>> = Vec::new();
        joins.extend(self.controller.lock().take());
        joins.extend(self.workers.lock().drain(..).map(|w| w.join));
        joins.append(&mut self.retired.lock());

        let deadline = Instant::now() + grace;
        while joins.iter().any(|j| !j.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }

        let mut detached = 0;
        for join in joins {
            if join.is_finished() {
                if join.join().is_err() {
                    tracing::error!("[{}] worker thread panicked", self.name);
                }
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            tracing::warn!("[{}] {} thread(s) still busy, detached", self.name, detached);
        }
        detached
    }
}
