//! TCP echo server on the socket reactor.
//!
//! ```text
//! cargo run --example echo_server -- 127.0.0.1:7007 [runtime.toml]
//! ```

use anyhow::{Result, anyhow};
use stagert::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Echo {
    bytes: AtomicU64,
}

impl EventHandler for Echo {
    type Event = SocketEvent;

    fn handle_events(&self, batch: Vec<SocketEvent>) -> Result<()> {
        for event in batch {
            match event {
                SocketEvent::Connected(conn) => {
                    tracing::info!("[echo] {} from {}", conn.id(), conn.peer_addr())
                }
                SocketEvent::Data { conn, bytes, .. } => {
                    self.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    conn.write(bytes).map_err(|e| anyhow!("{}: {}", conn.id(), e))?;
                }
                SocketEvent::Clogged { conn, pending } => {
                    tracing::warn!("[echo] {} clogged with {} writes", conn.id(), pending)
                }
                SocketEvent::Closed { conn } => tracing::info!("[echo] {} closed", conn.id()),
                SocketEvent::Fault { conn, error } => {
                    tracing::warn!("[echo] {} failed: {}", conn.id(), error)
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        tracing::info!("[echo] {} bytes echoed", self.bytes.load(Ordering::Relaxed));
    }
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:7007".to_string());

    // optional config file; the socket layer is enabled either way
    let mut builder = match args.next() {
        Some(path) => StageRuntimeBuilder::from_file(path)?,
        None => StageRuntime::builder(RuntimeConfig {
            logger: LoggerConfig::from_env(),
            ..RuntimeConfig::default()
        }),
    };
    if builder.config().socket.is_none() {
        builder = builder.socket(SocketConfig::default());
    }
    let _guard = builder.init_logger()?;
    let rt = builder.stage("echo", Echo::default()).build()?;

    let handle = rt.handle();
    let sockets = handle
        .sockets()
        .ok_or_else(|| anyhow!("socket layer not configured"))?;
    let (_, local) = sockets.listen(addr.as_str(), handle.sink::<SocketEvent>("echo")?)?;
    tracing::info!("[echo] listening on {}", local);

    rt.run_blocking()
}
