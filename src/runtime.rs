use crate::config::{RuntimeConfig, SocketConfig};
use crate::control::policy::Policy;
use crate::io::base::SinkRef;
use crate::io::queue::FiniteQueue;
use crate::model::{EventHandler, StageContext};
use crate::socket::{SocketHandle, SocketLayer};
use crate::stage::{PendingStage, StageControl, StagePrep};
use crate::utils::CancelToken;
use crate::utils::config_io::load_cfg;
use ahash::AHashMap;
use anyhow::{Context, Result, anyhow, bail};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::any::{Any, type_name};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;

const SIGNAL_POLL: Duration = Duration::from_millis(50);

/// Stage queues by name. Built once by the builder, read-only afterwards.
#[derive(Default)]
struct Registry {
    queues: AHashMap<String, Arc<dyn Any + Send + Sync>>,
    order: Vec<String>,
}

struct ManagerInner {
    cfg: RuntimeConfig,
    registry: Registry,
    sockets: Option<SocketHandle>,
    shutdown: AtomicBool,
}

/// Lookup and enqueue facility handed to every stage.
#[derive(Clone)]
pub struct ManagerHandle {
    inner: Arc<ManagerInner>,
}

impl ManagerHandle {
    /// A handle with no stages, no sockets and default config.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cfg: RuntimeConfig::default(),
                registry: Registry::default(),
                sockets: None,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue side of stage `name`, typed by its event.
    pub fn sink<E: Send + 'static>(&self, name: &str) -> Result<SinkRef<E>> {
        let queue = self
            .inner
            .registry
            .queues
            .get(name)
            .ok_or_else(|| anyhow!("no stage named '{name}'"))?
            .clone();
        let queue = queue
            .downcast::<FiniteQueue<E>>()
            .map_err(|_| anyhow!("stage '{name}' does not accept {}", type_name::<E>()))?;
        Ok(queue)
    }

    /// One-shot enqueue. The event is lost on failure; use [`sink`](Self::sink)
    /// to get it back.
    pub fn enqueue<E: Send + 'static>(&self, name: &str, event: E) -> Result<()> {
        self.sink::<E>(name)?
            .enqueue(event)
            .map_err(|e| anyhow!("[{name}] enqueue failed: {}", e.reason))
    }

    /// Stage names in creation order.
    pub fn stage_names(&self) -> &[String] {
        &self.inner.registry.order
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.cfg
    }

    /// `None` unless the config has a `socket` section.
    pub fn sockets(&self) -> Option<&SocketHandle> {
        self.inner.sockets.as_ref()
    }

    /// Ask [`StageRuntime::run_blocking`] to return.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

/// Declares stages, then brings them up together.
pub struct StageRuntimeBuilder {
    cfg: RuntimeConfig,
    pending: Vec<Box<dyn StagePrep>>,
    registry: Registry,
    errors: Vec<String>,
}

impl StageRuntimeBuilder {
    pub fn new(cfg: RuntimeConfig) -> Self {
        Self {
            cfg,
            pending: Vec::new(),
            registry: Registry::default(),
            errors: Vec::new(),
        }
    }

    /// Builder over a config file (any format the `config` crate reads),
    /// with `STAGERT__*` environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let cfg: RuntimeConfig = load_cfg(path)?;
        Ok(Self::new(cfg))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    /// Enable the socket layer, replacing any configured settings.
    pub fn socket(mut self, cfg: SocketConfig) -> Self {
        self.cfg.socket = Some(cfg);
        self
    }

    /// Install the global subscriber from the `logger` section. Keep the
    /// guard alive for file logging to flush.
    pub fn init_logger(&self) -> Result<Option<WorkerGuard>> {
        self.cfg.logger.init()
    }

    /// Declare a stage. Its queue exists from here on, configured from the
    /// stage's entry in `stages` or from `defaults`.
    pub fn stage<H: EventHandler>(self, name: impl Into<String>, handler: H) -> Self {
        let name = name.into();
        let cfg = self.cfg.stage_config(&name);
        self.push(PendingStage::new(name, cfg, handler))
    }

    /// Like [`stage`](Self::stage), with a custom thread/batch policy.
    pub fn stage_with_policy<H: EventHandler>(
        self,
        name: impl Into<String>,
        handler: H,
        policy: Box<dyn Policy>,
    ) -> Self {
        let name = name.into();
        let cfg = self.cfg.stage_config(&name);
        self.push(PendingStage::new(name, cfg, handler).with_policy(policy))
    }

    fn push<H: EventHandler>(mut self, pending: PendingStage<H>) -> Self {
        let name = StagePrep::name(&pending).to_owned();
        if self.registry.queues.contains_key(&name) {
            self.errors.push(format!("duplicate stage name '{name}'"));
            return self;
        }
        let queue: Arc<dyn Any + Send + Sync> = pending.queue().clone();
        self.registry.queues.insert(name.clone(), queue);
        self.registry.order.push(name);
        self.pending.push(Box::new(pending));
        self
    }

    /// Validate, start the socket layer, `init` every handler, then spawn
    /// every pool. Any failure tears down what already started.
    pub fn build(self) -> Result<StageRuntime> {
        let StageRuntimeBuilder {
            cfg,
            pending,
            registry,
            errors,
        } = self;

        let invalid = errors.into_iter().next().map(|e| anyhow!(e)).or_else(|| {
            pending
                .iter()
                .find_map(|p| p.config().validate(p.name()).err())
        });
        if let Some(err) = invalid {
            pending.into_iter().for_each(|p| p.abandon());
            return Err(err.context("invalid runtime configuration"));
        }

        let cancel = CancelToken::new_root();
        let mut sockets = match &cfg.socket {
            Some(socket_cfg) => match SocketLayer::start(socket_cfg, &cancel) {
                Ok(layer) => Some(layer),
                Err(e) => {
                    pending.into_iter().for_each(|p| p.abandon());
                    return Err(e.context("start socket layer"));
                }
            },
            None => None,
        };

        let manager = ManagerHandle {
            inner: Arc::new(ManagerInner {
                sockets: sockets.as_ref().map(|s| s.handle()),
                cfg,
                registry,
                shutdown: AtomicBool::new(false),
            }),
        };

        let mut pending = pending;
        for idx in 0..pending.len() {
            let name = pending[idx].name().to_owned();
            let args = pending[idx].config().init_args.clone();
            let ctx = StageContext::new(name, args, manager.clone());
            if let Err(e) = pending[idx].init(&ctx) {
                pending.into_iter().for_each(|p| p.abandon());
                if let Some(layer) = sockets.as_mut() {
                    layer.shutdown();
                }
                return Err(e);
            }
        }

        let mut stages: Vec<Box<dyn StageControl>> = Vec::with_capacity(pending.len());
        let mut rest = pending.into_iter();
        while let Some(prep) = rest.next() {
            let name = prep.name().to_owned();
            match prep.start(&cancel) {
                Ok(stage) => stages.push(stage),
                Err(e) => {
                    rest.by_ref().for_each(|p| p.abandon());
                    if let Some(layer) = sockets.as_mut() {
                        layer.shutdown();
                    }
                    for stage in stages.iter_mut().rev() {
                        stage.shutdown();
                    }
                    return Err(e.context(format!("[{name}] start failed")));
                }
            }
        }

        tracing::info!(
            "[StageRuntime] {} stage(s) running{}",
            stages.len(),
            if sockets.is_some() { ", sockets up" } else { "" }
        );

        Ok(StageRuntime {
            stages,
            sockets,
            manager,
            cancel,
            stopped: false,
        })
    }
}

/// Running stage graph.
pub struct StageRuntime {
    stages: Vec<Box<dyn StageControl>>,
    sockets: Option<SocketLayer>,
    manager: ManagerHandle,
    cancel: CancelToken,
    stopped: bool,
}

impl StageRuntime {
    pub fn builder(cfg: RuntimeConfig) -> StageRuntimeBuilder {
        StageRuntimeBuilder::new(cfg)
    }

    pub fn handle(&self) -> ManagerHandle {
        self.manager.clone()
    }

    pub fn stage(&self, name: &str) -> Option<&dyn StageControl> {
        self.stages
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn stages(&self) -> impl Iterator<Item = &dyn StageControl> {
        self.stages.iter().map(|s| s.as_ref())
    }

    pub fn sockets(&self) -> Option<&SocketLayer> {
        self.sockets.as_ref()
    }

    /// Block until SIGINT/SIGTERM or [`ManagerHandle::request_shutdown`],
    /// then shut down.
    pub fn run_blocking(mut self) -> Result<()> {
        let term_flag = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register(*sig, term_flag.clone())
                .with_context(|| format!("register handler for signal {sig}"))?;
        }

        loop {
            if term_flag.load(Ordering::Relaxed) {
                tracing::warn!("[StageRuntime] termination signal received");
                break;
            }
            if self.manager.shutdown_requested() {
                tracing::info!("[StageRuntime] shutdown requested");
                break;
            }
            thread::sleep(SIGNAL_POLL);
        }

        self.shutdown();
        Ok(())
    }

    /// Stop sockets first (their terminal events still reach running
    /// stages), then stages in reverse creation order. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(layer) = self.sockets.as_mut() {
            layer.shutdown();
        }
        let mut leftovers = 0;
        for stage in self.stages.iter_mut().rev() {
            leftovers += stage.shutdown();
        }
        self.cancel.cancel();
        tracing::info!(
            "[StageRuntime] stopped, {} undelivered event(s)",
            leftovers
        );
    }
}

impl Drop for StageRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;

    struct Nop;

    impl EventHandler for Nop {
        type Event = String;

        fn handle_events(&self, _: Vec<String>) -> Result<()> {
            Ok(())
        }
    }

    struct FailInit;

    impl EventHandler for FailInit {
        type Event = ();

        fn init(&mut self, _: &StageContext) -> Result<()> {
            bail!("missing dependency")
        }

        fn handle_events(&self, _: Vec<()>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_names_fail_build() {
        let err = StageRuntimeBuilder::new(RuntimeConfig::default())
            .stage("a", Nop)
            .stage("a", Nop)
            .build()
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("duplicate stage name 'a'"));
    }

    #[test]
    fn invalid_thread_bounds_fail_build() {
        let mut cfg = RuntimeConfig::default();
        cfg.stages.insert(
            "bad".into(),
            StageConfig {
                min_threads: 4,
                max_threads: 2,
                ..StageConfig::default()
            },
        );
        assert!(StageRuntimeBuilder::new(cfg).stage("bad", Nop).build().is_err());
    }

    #[test]
    fn failing_init_aborts_startup() {
        let err = StageRuntimeBuilder::new(RuntimeConfig::default())
            .stage("ok", Nop)
            .stage("broken", FailInit)
            .build()
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("missing dependency"));
    }

    #[test]
    fn sink_lookup_is_typed() {
        let mut rt = StageRuntimeBuilder::new(RuntimeConfig::default())
            .stage("strings", Nop)
            .build()
            .unwrap();
        let handle = rt.handle();
        assert_eq!(handle.stage_names(), ["strings".to_string()]);
        assert!(handle.sink::<String>("strings").is_ok());
        assert!(handle.sink::<u32>("strings").is_err());
        assert!(handle.sink::<String>("nope").is_err());
        handle.enqueue("strings", "x".to_string()).unwrap();
        assert!(handle.sockets().is_none());
        assert_eq!(rt.stage("strings").map(|s| s.is_running()), Some(true));

        rt.shutdown();
        assert!(handle.enqueue("strings", "late".to_string()).is_err());
    }

    #[test]
    fn detached_handle_resolves_nothing() {
        let handle = ManagerHandle::detached();
        assert!(handle.stage_names().is_empty());
        assert!(handle.enqueue("any", 1u8).is_err());
        handle.request_shutdown();
        assert!(handle.shutdown_requested());
    }

    #[test]
    fn socket_override_starts_the_layer() {
        let builder = StageRuntime::builder(RuntimeConfig::default());
        assert!(builder.config().socket.is_none());
        let builder = builder.socket(SocketConfig {
            accept_batch: 4,
            ..SocketConfig::default()
        });
        assert_eq!(builder.config().socket.as_ref().map(|s| s.accept_batch), Some(4));

        let mut rt = builder.stage("strings", Nop).build().unwrap();
        assert!(rt.handle().sockets().is_some());
        assert!(rt.sockets().is_some());
        rt.shutdown();
    }
}
