use anyhow::Context;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rolling: Option<String>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_files() -> usize {
    2
}

impl LoggerConfig {
    /// Reads STAGERT_LOG_LEVEL, STAGERT_LOG_DIR, STAGERT_LOG_PREFIX and
    /// STAGERT_LOG_ROLLING, falling back to stdout at `info`.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("STAGERT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file_dir: std::env::var("STAGERT_LOG_DIR").ok(),
            file_prefix: std::env::var("STAGERT_LOG_PREFIX").ok(),
            rolling: std::env::var("STAGERT_LOG_ROLLING").ok(),
            max_files: default_max_files(),
        }
    }

    /// Install the global subscriber. Stage worker threads are named, so
    /// thread names are always included. Keep the returned guard alive for
    /// file logging to flush.
    pub fn init(&self) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        let Some(dir) = self.file_dir.as_deref() else {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_thread_names(true)
                .try_init();
            tracing::info!("logging to stdout (no file_dir)");
            return Ok(None);
        };

        let prefix = self.file_prefix.as_deref().unwrap_or("stagert");
        let rotation = match self.rolling.as_deref() {
            Some("hourly") => Rotation::HOURLY,
            Some("minutely") => Rotation::MINUTELY,
            Some("never") => Rotation::NEVER,
            _ => Rotation::DAILY,
        };

        let appender = RollingFileAppender::builder()
            .rotation(rotation)
            .max_log_files(self.max_files)
            .filename_prefix(prefix)
            .build(dir)
            .with_context(|| format!("failed to create rolling appender in {dir}"))?;

        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_thread_names(true)
            .with_ansi(false)
            .with_writer(writer)
            .try_init();

        tracing::info!(
            "logging to dir: {}, prefix: {}, rotation: {:?}",
            dir,
            prefix,
            self.rolling
        );
        Ok(Some(guard))
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: default_max_files(),
        }
    }
}

/// Rate limiter for a single log call site.
///
/// At most one message per `interval` gets through; the next one that does
/// reports how many were suppressed in between. Used on handler-fault and
/// reactor-fault paths so a poisoned event stream cannot flood the log.
///
/// ```ignore
/// error_throttled!(Duration::from_secs(5), "[{}] handler fault: {}", stage, err);
/// ```
pub struct Throttle {
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
            interval,
        }
    }

    /// `Some(suppressed_count)` when the caller may log now.
    #[inline]
    pub fn poll(&self) -> Option<u64> {
        let mut last = self.last.lock();
        let open = match *last {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        };
        if open {
            *last = Some(Instant::now());
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// Throttled logging at an arbitrary level (`error`, `warn`, `info`, `debug`, `trace`).
#[macro_export]
macro_rules! log_throttled {
    ($level:ident, $interval:expr, $($arg:tt)*) => {{
        static _THROTTLE: std::sync::OnceLock<$crate::utils::logger::Throttle> =
            std::sync::OnceLock::new();
        let t = _THROTTLE.get_or_init(|| $crate::utils::logger::Throttle::new($interval));
        if let Some(_suppressed) = t.poll() {
            if _suppressed > 0 {
                $crate::tracing::$level!(suppressed = _suppressed, $($arg)*);
            } else {
                $crate::tracing::$level!($($arg)*);
            }
        }
    }};
}

#[macro_export]
macro_rules! error_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(error, $interval, $($arg)*); } }
#[macro_export]
macro_rules! warn_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(warn,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! info_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(info,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! debug_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(debug, $interval, $($arg)*); } }
