use crate::config::ConfigData;
use crate::runtime::ManagerHandle;
use crate::socket::Readiness;
use anyhow::Result;

/// Marker for values that can travel through stage queues.
///
/// Ownership moves into the queue on a successful enqueue and out to exactly
/// one handler invocation on dequeue.
pub trait StageEvent: Send + 'static {}

impl<T: Send + 'static> StageEvent for T {}

/// What a handler sees at `init`.
#[derive(Clone)]
pub struct StageContext {
    name: String,
    config: ConfigData,
    manager: ManagerHandle,
}

impl StageContext {
    pub fn new(name: impl Into<String>, config: ConfigData, manager: ManagerHandle) -> Self {
        Self {
            name: name.into(),
            config,
            manager,
        }
    }

    /// Stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler settings (`init_args` of the stage config).
    pub fn config(&self) -> &ConfigData {
        &self.config
    }

    /// Lookup/enqueue facility for other stages.
    pub fn manager(&self) -> &ManagerHandle {
        &self.manager
    }
}

/// Application logic bound to one stage.
///
/// One instance is shared by every worker thread of the stage, hence `&self`
/// on the hot path; per-handler mutable state needs interior mutability.
pub trait EventHandler: Send + Sync + 'static {
    /// Events accepted by this stage's queue.
    type Event: StageEvent;

    /// Called once before any worker starts. An error aborts stage startup.
    fn init(&mut self, ctx: &StageContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Process one dequeued batch.
    ///
    /// An `Err` or a panic is logged and counted; the batch is treated as
    /// consumed and never redelivered.
    fn handle_events(&self, batch: Vec<Self::Event>) -> Result<()>;

    /// Process readiness results from an attached select source.
    fn handle_readiness(&self, batch: Vec<Readiness>) -> Result<()> {
        let _ = batch;
        Ok(())
    }

    /// Called once after every worker has exited.
    fn destroy(&self) {}
}
