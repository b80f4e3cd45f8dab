//! A stage: one handler, one input queue, one self-tuning thread pool.

pub mod pool;
pub mod worker;

pub use pool::{Occupancy, ThreadPool};
pub use worker::ReadinessSource;

use crate::config::StageConfig;
use crate::control::ResponseTimeController;
use crate::control::policy::Policy;
use crate::control::stats::{StageStats, StatsSnapshot};
use crate::io::base::{EventSink, EventSource, SinkRef};
use crate::io::queue::FiniteQueue;
use crate::model::{EventHandler, StageContext};
use crate::utils::{CancelToken, HealthFlag};
use anyhow::{Context, Result};
use pool::Spawner;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::thread;
use std::time::Duration;
use worker::WorkerShared;

/// Extra time granted to a worker finishing its last batch on shutdown.
const SHUTDOWN_SLACK: Duration = Duration::from_millis(500);

/// Type-erased lifecycle of a running stage.
pub trait StageControl: Send + Sync {
    fn name(&self) -> &str;
    fn queue_len(&self) -> usize;
    fn queue_capacity(&self) -> Option<usize>;
    fn num_threads(&self) -> usize;
    fn stats(&self) -> StatsSnapshot;
    fn is_running(&self) -> bool;
    /// Close the queue, stop the workers, destroy the handler. Returns the
    /// number of events left undelivered. Idempotent.
    fn shutdown(&mut self) -> usize;
}

/// Type-erased stage that has a queue but no threads yet.
pub(crate) trait StagePrep: Send {
    fn name(&self) -> &str;
    fn config(&self) -> &StageConfig;
    fn init(&mut self, ctx: &StageContext) -> Result<()>;
    fn start(self: Box<Self>, cancel: &CancelToken) -> Result<Box<dyn StageControl>>;
    /// Drop without starting; destroys the handler if it was initialized.
    fn abandon(self: Box<Self>);
}

/// Stage between construction and start.
pub struct PendingStage<H: EventHandler> {
    name: String,
    cfg: StageConfig,
    queue: Arc<FiniteQueue<H::Event>>,
    handler: H,
    select: Option<Arc<dyn ReadinessSource>>,
    policy: Option<Box<dyn Policy>>,
    initialized: bool,
}

impl<H: EventHandler> PendingStage<H> {
    /// Creates the input queue right away so other stages can resolve it
    /// before this one starts.
    pub fn new(name: impl Into<String>, cfg: StageConfig, handler: H) -> Self {
        let name = name.into();
        let queue = Arc::new(FiniteQueue::new(name.clone(), cfg.capacity()));
        Self {
            name,
            cfg,
            queue,
            handler,
            select: None,
            policy: None,
            initialized: false,
        }
    }

    /// Multiplex readiness from `select` on this stage's workers.
    pub fn with_select(mut self, select: Arc<dyn ReadinessSource>) -> Self {
        self.select = Some(select);
        self
    }

    /// Replace the response-time controller.
    pub fn with_policy(mut self, policy: Box<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn queue(&self) -> &Arc<FiniteQueue<H::Event>> {
        &self.queue
    }

    pub fn init(&mut self, ctx: &StageContext) -> Result<()> {
        self.handler
            .init(ctx)
            .with_context(|| format!("[{}] handler init failed", self.name))?;
        self.initialized = true;
        Ok(())
    }

    /// Spawn the pool (and controller, if enabled). On failure the handler is
    /// destroyed and the queue closed.
    pub fn start(self, cancel: &CancelToken) -> Result<Stage<H>> {
        let PendingStage {
            name,
            cfg,
            queue,
            handler,
            select,
            policy,
            initialized: _,
        } = self;

        let handler = Arc::new(handler);
        let stats = Arc::new(StageStats::new(name.clone(), cfg.stats.clone()));
        let batch_target = Arc::new(AtomicUsize::new(cfg.batch_limit().unwrap_or(0)));

        let shared = Arc::new(WorkerShared {
            name: name.clone(),
            handler: handler.clone(),
            queue: queue.clone(),
            select,
            stats: stats.clone(),
            batch_target: batch_target.clone(),
            queue_timeout: cfg.queue_timeout(),
            select_timeout: cfg.select_timeout(),
            select_spin: cfg.select_spin,
        });

        let spawner: Spawner = {
            let name = name.clone();
            Arc::new(move |cancel: CancelToken, idx: usize| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("{name}-{idx}"))
                    .spawn(move || shared.run(cancel))
            })
        };

        let pool = Arc::new(ThreadPool::new(
            name.clone(),
            cancel.new_child(),
            spawner,
            cfg.min_threads,
            cfg.max_threads,
            batch_target,
        ));

        let mut stage = Stage {
            name,
            cfg,
            queue,
            handler,
            stats,
            pool,
            health: HealthFlag::new(false),
            stopped: false,
        };

        if let Err(e) = stage.spawn_threads(policy) {
            stage.shutdown();
            return Err(e);
        }
        stage.health.up();
        tracing::info!(
            "[{}] started: {} thread(s), capacity {:?}, batch {:?}",
            stage.name,
            stage.pool.num_threads(),
            stage.cfg.capacity(),
            stage.pool.batch_target()
        );
        Ok(stage)
    }
}

impl<H: EventHandler> StagePrep for PendingStage<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &StageConfig {
        &self.cfg
    }

    fn init(&mut self, ctx: &StageContext) -> Result<()> {
        PendingStage::init(self, ctx)
    }

    fn start(self: Box<Self>, cancel: &CancelToken) -> Result<Box<dyn StageControl>> {
        Ok(Box::new(PendingStage::start(*self, cancel)?))
    }

    fn abandon(self: Box<Self>) {
        self.queue.close();
        if self.initialized {
            self.handler.destroy();
        }
    }
}

/// A running stage.
pub struct Stage<H: EventHandler> {
    name: String,
    cfg: StageConfig,
    queue: Arc<FiniteQueue<H::Event>>,
    handler: Arc<H>,
    stats: Arc<StageStats>,
    pool: Arc<ThreadPool>,
    health: HealthFlag,
    stopped: bool,
}

impl<H: EventHandler> Stage<H> {
    fn spawn_threads(&self, policy: Option<Box<dyn Policy>>) -> Result<()> {
        self.pool
            .start(self.cfg.initial_threads)
            .with_context(|| format!("[{}] cannot spawn workers", self.name))?;

        let policy = match policy {
            Some(policy) => policy,
            None if self.cfg.controller.enabled => Box::new(ResponseTimeController::new(
                self.cfg.controller.clone(),
                self.cfg.min_threads,
                self.cfg.max_threads,
            )),
            None => return Ok(()),
        };
        self.pool
            .spawn_controller(
                policy,
                self.cfg.controller.interval(),
                self.stats.clone(),
                self.queue.clone(),
            )
            .with_context(|| format!("[{}] cannot spawn controller", self.name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue-side handle on this stage's queue.
    pub fn sink(&self) -> SinkRef<H::Event> {
        self.queue.clone()
    }

    pub fn queue(&self) -> &Arc<FiniteQueue<H::Event>> {
        &self.queue
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn stats(&self) -> &Arc<StageStats> {
        &self.stats
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn health(&self) -> &HealthFlag {
        &self.health
    }

    fn shutdown_grace(&self) -> Duration {
        let select = self
            .cfg
            .select_timeout()
            .saturating_mul(self.cfg.select_spin.max(1) as u32);
        self.cfg.queue_timeout() + select + SHUTDOWN_SLACK
    }

    /// Close the queue, stop workers and destroy the handler. Returns the
    /// events nobody dequeued.
    pub fn shutdown_with_leftovers(&mut self) -> Vec<H::Event> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;
        self.health.down();

        self.queue.close();
        let detached = self.pool.shutdown(self.shutdown_grace());
        let leftovers = self.queue.dequeue_all().unwrap_or_default();

        if detached == 0 {
            self.handler.destroy();
        } else {
            tracing::warn!(
                "[{}] handler not destroyed, {} worker(s) still running",
                self.name,
                detached
            );
        }
        tracing::info!(
            "[{}] stopped: {} event(s) processed, {} fault(s), {} left in queue",
            self.name,
            self.stats.total_events(),
            self.stats.faults(),
            leftovers.len()
        );
        leftovers
    }
}

impl<H: EventHandler> StageControl for Stage<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn queue_capacity(&self) -> Option<usize> {
        self.queue.capacity()
    }

    fn num_threads(&self) -> usize {
        self.pool.num_threads()
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn is_running(&self) -> bool {
        self.health.get()
    }

    fn shutdown(&mut self) -> usize {
        self.shutdown_with_leftovers().len()
    }
}

impl<H: EventHandler> Drop for Stage<H> {
    fn drop(&mut self) {
        if !self.stopped {
            self.shutdown_with_leftovers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigData;
    use crate::runtime::ManagerHandle;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct Collect {
        seen: Arc<Mutex<Vec<u64>>>,
        prefix: String,
        destroyed: Arc<AtomicBool>,
    }

    impl EventHandler for Collect {
        type Event = u64;

        fn init(&mut self, ctx: &StageContext) -> Result<()> {
            self.prefix = ctx.config().get_string("prefix").unwrap_or_default();
            Ok(())
        }

        fn handle_events(&self, batch: Vec<u64>) -> Result<()> {
            if batch.contains(&13) {
                anyhow::bail!("unlucky batch");
            }
            if batch.contains(&666) {
                panic!("cursed batch");
            }
            self.seen.lock().extend(batch);
            Ok(())
        }

        fn destroy(&self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    fn cfg() -> StageConfig {
        StageConfig {
            queue_timeout_ms: 20,
            batch_target: 1,
            ..StageConfig::default()
        }
    }

    fn ctx(name: &str) -> StageContext {
        let mut data = ConfigData::new();
        data.set_string("prefix", "p");
        StageContext::new(name, data, ManagerHandle::detached())
    }

    fn wait_for(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        f()
    }

    #[test]
    fn delivers_events_and_counts_them() {
        let handler = Collect::default();
        let seen = handler.seen.clone();
        let destroyed = handler.destroyed.clone();

        let mut pending = PendingStage::new("collect", cfg(), handler);
        pending.init(&ctx("collect")).unwrap();
        let mut stage = pending.start(&CancelToken::new_root()).unwrap();
        assert!(stage.is_running());
        assert_eq!(stage.handler().prefix, "p");

        let sink = stage.sink();
        for i in 0..50 {
            sink.enqueue(i).unwrap();
        }
        assert!(wait_for(|| seen.lock().len() == 50));
        assert!(wait_for(|| stage.stats().total_events() == 50));

        assert_eq!(stage.shutdown_with_leftovers().len(), 0);
        assert!(destroyed.load(Ordering::SeqCst));
        assert!(!stage.is_running());
        assert!(sink.enqueue(1).unwrap_err().is_closed());
    }

    #[test]
    fn faults_do_not_kill_workers() {
        let handler = Collect::default();
        let seen = handler.seen.clone();
        let mut stage = PendingStage::new("faulty", cfg(), handler)
            .start(&CancelToken::new_root())
            .unwrap();

        let sink = stage.sink();
        for ev in [1, 13, 2, 666, 3] {
            sink.enqueue(ev).unwrap();
        }
        assert!(wait_for(|| seen.lock().len() == 3));
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert!(wait_for(|| stage.stats().faults() == 2));
        assert_eq!(stage.pool().num_threads(), 1);
        stage.shutdown();
    }

    #[test]
    fn abandon_destroys_initialized_handler() {
        let handler = Collect::default();
        let destroyed = handler.destroyed.clone();
        let mut pending: Box<dyn StagePrep> =
            Box::new(PendingStage::new("gone", cfg(), handler));
        pending.init(&ctx("gone")).unwrap();
        pending.abandon();
        assert!(destroyed.load(Ordering::SeqCst));
    }
}
