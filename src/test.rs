#[cfg(test)]
mod tests {
    use crate::config::{ControllerConfig, RuntimeConfig, SocketConfig, StageConfig};
    use crate::io::base::{EventSink, SinkRef};
    use crate::model::{EventHandler, StageContext};
    use crate::runtime::StageRuntimeBuilder;
    use crate::socket::SocketEvent;
    use crate::stage::{PendingStage, StageControl};
    use crate::utils::CancelToken;
    use anyhow::{Context, Result, anyhow};
    use parking_lot::Mutex;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        f()
    }

    // ---- parse -> sum pipeline

    #[derive(Default)]
    struct Parse {
        next: Option<SinkRef<u64>>,
    }

    impl EventHandler for Parse {
        type Event = String;

        fn init(&mut self, ctx: &StageContext) -> Result<()> {
            let target = ctx
                .config()
                .get_string("next")
                .context("'next' not configured")?;
            self.next = Some(ctx.manager().sink::<u64>(&target)?);
            Ok(())
        }

        fn handle_events(&self, batch: Vec<String>) -> Result<()> {
            let next = self.next.as_ref().ok_or_else(|| anyhow!("not initialized"))?;
            let parsed = batch
                .iter()
                .map(|s| s.trim().parse::<u64>())
                .collect::<Result<Vec<_>, _>>()?;
            // all-or-nothing handoff
            let key = next.prepare(parsed).map_err(|e| anyhow!("prepare: {e}"))?;
            next.commit(key).map_err(|e| anyhow!("commit: {e}"))?;
            Ok(())
        }
    }

    struct Sum {
        total: Arc<AtomicU64>,
        count: Arc<AtomicU64>,
    }

    impl EventHandler for Sum {
        type Event = u64;

        fn handle_events(&self, batch: Vec<u64>) -> Result<()> {
            self.count.fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.total
                .fetch_add(batch.iter().sum::<u64>(), Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn events_flow_through_a_stage_graph() {
        let mut cfg = RuntimeConfig::default();
        let mut parse_cfg = StageConfig {
            initial_threads: 2,
            max_threads: 4,
            batch_target: 16,
            queue_timeout_ms: 50,
            ..StageConfig::default()
        };
        parse_cfg.init_args.set_string("next", "sum");
        cfg.stages.insert("parse".into(), parse_cfg);

        let total = Arc::new(AtomicU64::new(0));
        let count = Arc::new(AtomicU64::new(0));
        let mut rt = StageRuntimeBuilder::new(cfg)
            .stage("parse", Parse::default())
            .stage(
                "sum",
                Sum {
                    total: total.clone(),
                    count: count.clone(),
                },
            )
            .build()
            .unwrap();

        let input = rt.handle().sink::<String>("parse").unwrap();
        for i in 1..=1000u64 {
            input.enqueue(i.to_string()).unwrap();
        }
        assert!(wait_for(Duration::from_secs(5), || {
            total.load(Ordering::Relaxed) == 500_500
        }));

        // a bad batch is dropped and counted, the stage keeps going
        input.enqueue("not a number".to_string()).unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            rt.stage("parse").map(|s| s.stats().faults) == Some(1)
        }));
        input.enqueue("5".to_string()).unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            total.load(Ordering::Relaxed) == 500_505
        }));

        assert!(wait_for(Duration::from_secs(5), || {
            rt.stage("parse").map(|s| s.stats().total_events) == Some(1002)
        }));
        assert_eq!(rt.stage("sum").unwrap().stats().faults, 0);

        rt.shutdown();
        assert_eq!(count.load(Ordering::Relaxed), 1001);
        assert!(rt.stage("sum").map(|s| s.is_running()) == Some(false));
    }

    // ---- shutdown behaviour

    struct Slow {
        seen: Arc<Mutex<Vec<u32>>>,
        pause: Duration,
    }

    impl EventHandler for Slow {
        type Event = u32;

        fn handle_events(&self, batch: Vec<u32>) -> Result<()> {
            thread::sleep(self.pause);
            self.seen.lock().extend(batch);
            Ok(())
        }
    }

    fn fixed_pool(threads: usize, queue_timeout_ms: u64) -> StageConfig {
        StageConfig {
            initial_threads: threads,
            min_threads: threads,
            max_threads: threads,
            batch_target: 1,
            queue_timeout_ms,
            controller: ControllerConfig {
                enabled: false,
                ..ControllerConfig::default()
            },
            ..StageConfig::default()
        }
    }

    #[test]
    fn shutdown_with_pending_events_delivers_each_at_most_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut stage = PendingStage::new(
            "slow",
            fixed_pool(4, 200),
            Slow {
                seen: seen.clone(),
                pause: Duration::from_millis(20),
            },
        )
        .start(&CancelToken::new_root())
        .unwrap();

        let sink = stage.sink();
        for i in 0..200 {
            sink.enqueue(i).unwrap();
        }
        thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        let leftovers = stage.shutdown_with_leftovers();
        assert!(started.elapsed() < Duration::from_millis(200 + 500));
        assert!(stage.queue().is_closed());

        let seen = seen.lock();
        let mut all: Vec<u32> = seen.iter().copied().chain(leftovers).collect();
        assert_eq!(all.len(), 200);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert!(seen.len() < 200);
    }

    #[test]
    fn blocked_workers_wake_on_close() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut stage = PendingStage::new(
            "idle",
            fixed_pool(4, 10_000),
            Slow {
                seen,
                pause: Duration::ZERO,
            },
        )
        .start(&CancelToken::new_root())
        .unwrap();
        assert_eq!(stage.pool().num_threads(), 4);
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert_eq!(StageControl::shutdown(&mut stage), 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stage.pool().num_threads(), 0);
    }

    // ---- controller on a live stage

    #[test]
    fn backlog_grows_the_pool() {
        let mut cfg = fixed_pool(1, 50);
        cfg.max_threads = 4;
        cfg.controller = ControllerConfig {
            enabled: true,
            interval_ms: 20,
            high_water: 10,
            sustain_intervals: 1,
            ..ControllerConfig::default()
        };
        let mut stage = PendingStage::new(
            "grow",
            cfg,
            Slow {
                seen: Arc::new(Mutex::new(Vec::new())),
                pause: Duration::from_millis(5),
            },
        )
        .start(&CancelToken::new_root())
        .unwrap();

        let sink = stage.sink();
        for i in 0..2000 {
            sink.enqueue(i).unwrap();
        }
        assert!(wait_for(Duration::from_secs(3), || stage.pool().num_threads() > 1));
        assert!(stage.pool().num_threads() <= 4);
        stage.shutdown_with_leftovers();
    }

    // ---- sockets through the runtime

    struct Echo;

    impl EventHandler for Echo {
        type Event = SocketEvent;

        fn handle_events(&self, batch: Vec<SocketEvent>) -> Result<()> {
            for event in batch {
                if let SocketEvent::Data { conn, bytes, .. } = event {
                    conn.write(bytes).map_err(|e| anyhow!("echo write: {e}"))?;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn loopback_echo_through_runtime() {
        let cfg = RuntimeConfig {
            socket: Some(SocketConfig::default()),
            ..RuntimeConfig::default()
        };
        let mut rt = StageRuntimeBuilder::new(cfg).stage("echo", Echo).build().unwrap();
        let handle = rt.handle();
        let sockets = handle.sockets().unwrap();
        let (_, addr) = sockets
            .listen("127.0.0.1:0", handle.sink::<SocketEvent>("echo").unwrap())
            .unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut echoed = Vec::new();
        for round in 0..20u8 {
            let msg = [round; 100];
            client.write_all(&msg).unwrap();
            let mut back = [0u8; 100];
            client.read_exact(&mut back).unwrap();
            echoed.extend_from_slice(&back);
        }
        assert_eq!(echoed.len(), 2000);
        assert!(echoed.chunks(100).enumerate().all(|(i, c)| c.iter().all(|b| *b == i as u8)));

        rt.shutdown();
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);
    }

    // ---- config file

    #[test]
    fn builder_from_config_file() {
        let path = std::env::temp_dir().join(format!("stagert-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[defaults]
queue_capacity = 128
queue_timeout_ms = 25

[stages.hot]
initial_threads = 2
max_threads = 6
batch_target = 32

[stages.hot.init_args]
mode = "fast"
limit = "7"
"#,
        )
        .unwrap();

        let builder = StageRuntimeBuilder::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let cfg = builder.config();
        assert_eq!(cfg.defaults.capacity(), Some(128));
        let hot = cfg.stage_config("hot");
        assert_eq!(hot.initial_threads, 2);
        assert_eq!(hot.batch_limit(), Some(32));
        assert_eq!(hot.init_args.get_string("mode").as_deref(), Some("fast"));
        assert_eq!(hot.init_args.get_int("limit"), Some(7));
        assert_eq!(cfg.stage_config("other").queue_timeout_ms, 25);
    }
}
