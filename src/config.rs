//! Runtime configuration.
//!
//! Everything here is plain serde data, loadable through
//! [`load_cfg`](crate::utils::config_io::load_cfg). Handler-specific settings
//! live in [`ConfigData`], a flat string-keyed map resolved once when the
//! stage is constructed.

use crate::utils::logger::LoggerConfig;
use anyhow::{Result, bail};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Used for every stage without its own entry in `stages`.
    #[serde(default)]
    pub defaults: StageConfig,
    #[serde(default)]
    pub stages: HashMap<String, StageConfig>,
    /// Starts the socket layer when present.
    #[serde(default)]
    pub socket: Option<SocketConfig>,
}

impl RuntimeConfig {
    /// Per-stage entry if configured, otherwise the defaults.
    pub fn stage_config(&self, name: &str) -> StageConfig {
        self.stages
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// `<= 0` means unbounded.
    pub queue_capacity: i64,
    pub initial_threads: usize,
    pub min_threads: usize,
    pub max_threads: usize,
    /// Initial aggregation target; `-1` drains everything available.
    pub batch_target: i64,
    pub queue_timeout_ms: u64,
    pub select_timeout_ms: u64,
    /// Select passes per scheduling iteration when a select source is attached.
    pub select_spin: usize,
    pub controller: ControllerConfig,
    pub stats: StatsConfig,
    pub init_args: ConfigData,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: -1,
            initial_threads: 1,
            min_threads: 1,
            max_threads: 8,
            batch_target: -1,
            queue_timeout_ms: 1000,
            select_timeout_ms: 20,
            select_spin: 8,
            controller: ControllerConfig::default(),
            stats: StatsConfig::default(),
            init_args: ConfigData::default(),
        }
    }
}

impl StageConfig {
    pub fn validate(&self, stage: &str) -> Result<()> {
        if self.max_threads == 0 {
            bail!("[{stage}] max_threads must be at least 1");
        }
        if self.min_threads > self.max_threads {
            bail!(
                "[{stage}] min_threads ({}) exceeds max_threads ({})",
                self.min_threads,
                self.max_threads
            );
        }
        if self.initial_threads < self.min_threads || self.initial_threads > self.max_threads {
            bail!(
                "[{stage}] initial_threads ({}) outside [{}, {}]",
                self.initial_threads,
                self.min_threads,
                self.max_threads
            );
        }
        if self.batch_target == 0 || self.batch_target < -1 {
            bail!("[{stage}] batch_target must be -1 or positive");
        }
        if self.controller.tune_batch && self.controller.batch_min > self.controller.batch_max {
            bail!("[{stage}] controller batch_min exceeds batch_max");
        }
        if !(0.0..=1.0).contains(&self.stats.smoothing_alpha) {
            bail!("[{stage}] smoothing_alpha must be within [0, 1]");
        }
        Ok(())
    }

    pub fn capacity(&self) -> Option<usize> {
        usize::try_from(self.queue_capacity).ok().filter(|c| *c > 0)
    }

    pub fn batch_limit(&self) -> Option<usize> {
        usize::try_from(self.batch_target).ok().filter(|b| *b > 0)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    /// Fixed single-thread pool, as used by reactor stages.
    pub fn single_threaded(mut self) -> Self {
        self.initial_threads = 1;
        self.min_threads = 1;
        self.max_threads = 1;
        self.controller.enabled = false;
        self
    }
}

/// Response-time controller knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// p90 latency the batch tuner aims to stay under.
    pub target_latency_ms: f64,
    /// Queue length counted as "high occupancy".
    pub high_water: usize,
    /// Queue length counted as "idle".
    pub low_water: usize,
    /// Consecutive intervals a condition must hold before threads change.
    pub sustain_intervals: u32,
    pub tune_batch: bool,
    pub batch_min: usize,
    pub batch_max: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 500,
            target_latency_ms: 100.0,
            high_water: 32,
            low_water: 0,
            sustain_intervals: 3,
            tune_batch: false,
            batch_min: 1,
            batch_max: 1024,
        }
    }
}

impl ControllerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub smoothing_alpha: f64,
    /// Service-rate samples per estimation window.
    pub estimation_samples: u32,
    pub estimation_window_ms: u64,
    /// Size of the per-batch latency ring used for percentiles.
    pub latency_samples: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.7,
            estimation_samples: 100,
            estimation_window_ms: 1000,
            latency_samples: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub read_buffer_size: usize,
    /// Attempts to hand a read packet to a full sink before dropping it; `-1` retries forever.
    pub read_clog_tries: i64,
    /// Consecutive unfinished write attempts before a connection counts as clogged.
    pub write_clog_threshold: u32,
    /// Queued writes per connection before `write` reports Full; `0` is unbounded.
    pub max_outstanding_writes: usize,
    /// Connections accepted per listen wakeup.
    pub accept_batch: usize,
    pub queue_capacity: i64,
    pub queue_timeout_ms: u64,
    pub select_timeout_ms: u64,
    pub select_spin: usize,
    pub select_batch: i64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192,
            read_clog_tries: -1,
            write_clog_threshold: 64,
            max_outstanding_writes: 0,
            accept_batch: 64,
            queue_capacity: -1,
            queue_timeout_ms: 100,
            select_timeout_ms: 20,
            select_spin: 8,
            select_batch: -1,
        }
    }
}

impl SocketConfig {
    /// Stage settings shared by the read, write and listen reactor stages.
    pub fn stage_config(&self) -> StageConfig {
        StageConfig {
            queue_capacity: self.queue_capacity,
            batch_target: self.select_batch,
            queue_timeout_ms: self.queue_timeout_ms,
            select_timeout_ms: self.select_timeout_ms,
            select_spin: self.select_spin,
            ..StageConfig::default()
        }
        .single_threaded()
    }

    pub fn read_clog_limit(&self) -> Option<u32> {
        u32::try_from(self.read_clog_tries).ok()
    }
}

/// A single handler configuration value.
#[derive(Clone)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    StrList(Vec<String>),
    /// Opaque value set programmatically or a nested config table.
    Object(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Str(v) => write!(f, "{v:?}"),
            ConfigValue::Int(v) => write!(f, "{v}"),
            ConfigValue::Double(v) => write!(f, "{v}"),
            ConfigValue::Bool(v) => write!(f, "{v}"),
            ConfigValue::StrList(v) => write!(f, "{v:?}"),
            ConfigValue::Object(_) => write!(f, "<object>"),
        }
    }
}

impl From<Value> for ConfigValue {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => ConfigValue::Str(s),
            Value::Bool(b) => ConfigValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ConfigValue::Int(i),
                None => ConfigValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::Array(items) => ConfigValue::StrList(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            other => ConfigValue::Object(Arc::new(other)),
        }
    }
}

/// Flat key/value configuration handed to a handler's `init`.
///
/// Getters coerce leniently: a string `"42"` reads as int 42, `"true"` as a
/// boolean, and a string holding a list reads as a string list split on
/// whitespace or commas.
#[derive(Debug, Clone, Default)]
pub struct ConfigData {
    values: BTreeMap<String, ConfigValue>,
}

impl<'de> Deserialize<'de> for ConfigData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let values = raw
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k, ConfigValue::from(v)))
            .collect();
        Ok(Self { values })
    }
}

impl ConfigData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            ConfigValue::Str(s) => Some(s.clone()),
            ConfigValue::Int(i) => Some(i.to_string()),
            ConfigValue::Double(d) => Some(d.to_string()),
            ConfigValue::Bool(b) => Some(b.to_string()),
            ConfigValue::StrList(l) => Some(l.join(" ")),
            ConfigValue::Object(_) => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            ConfigValue::Int(i) => Some(*i),
            ConfigValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            ConfigValue::Double(d) => Some(*d),
            ConfigValue::Int(i) => Some(*i as f64),
            ConfigValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Missing and unrecognised values read as `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(ConfigValue::Bool(b)) => *b,
            Some(ConfigValue::Str(s)) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.values.get(key)? {
            ConfigValue::StrList(l) => Some(l.clone()),
            ConfigValue::Str(s) => Some(
                s.split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Downcast an opaque object value.
    pub fn get_object<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.values.get(key)? {
            ConfigValue::Object(obj) => obj.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), ConfigValue::Str(value.into()));
    }

    pub fn set_int(&mut self, key: impl Into<String>, value: i64) {
        self.values.insert(key.into(), ConfigValue::Int(value));
    }

    pub fn set_double(&mut self, key: impl Into<String>, value: f64) {
        self.values.insert(key.into(), ConfigValue::Double(value));
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.values.insert(key.into(), ConfigValue::Bool(value));
    }

    pub fn set_string_list(&mut self, key: impl Into<String>, value: Vec<String>) {
        self.values.insert(key.into(), ConfigValue::StrList(value));
    }

    pub fn set_object<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values
            .insert(key.into(), ConfigValue::Object(Arc::new(value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_data_coerces_scalars() {
        let data: ConfigData = serde_json::from_value(json!({
            "port": "8080",
            "ratio": 2,
            "verbose": "TRUE",
            "peers": "a.example, b.example c.example",
            "tags": ["x", 1],
            "nested": {"k": "v"},
            "gone": null
        }))
        .expect("deserialize");

        assert_eq!(data.get_int("port"), Some(8080));
        assert_eq!(data.get_double("ratio"), Some(2.0));
        assert!(data.get_bool("verbose"));
        assert!(!data.get_bool("missing"));
        assert_eq!(
            data.get_string_list("peers"),
            Some(vec![
                "a.example".to_string(),
                "b.example".to_string(),
                "c.example".to_string()
            ])
        );
        assert_eq!(
            data.get_string_list("tags"),
            Some(vec!["x".to_string(), "1".to_string()])
        );
        assert_eq!(
            data.get_object::<Value>("nested").as_deref(),
            Some(&json!({"k": "v"}))
        );
        assert!(!data.contains("gone"));
    }

    #[test]
    fn config_data_objects_round_trip_by_type() {
        #[derive(Debug, PartialEq)]
        struct Pool(u8);

        let mut data = ConfigData::new();
        data.set_object("pool", Pool(3));
        data.set_int("n", -1);
        assert_eq!(data.get_object::<Pool>("pool").as_deref(), Some(&Pool(3)));
        assert!(data.get_object::<String>("pool").is_none());
        assert_eq!(data.get_string("n"), Some("-1".to_string()));
    }

    #[test]
    fn stage_config_validation() {
        let mut cfg = StageConfig::default();
        assert!(cfg.validate("ok").is_ok());
        assert_eq!(cfg.capacity(), None);
        assert_eq!(cfg.batch_limit(), None);

        cfg.min_threads = 4;
        cfg.initial_threads = 2;
        assert!(cfg.validate("bad").is_err());

        let cfg = StageConfig {
            batch_target: 0,
            ..StageConfig::default()
        };
        assert!(cfg.validate("bad-batch").is_err());
    }

    #[test]
    fn runtime_config_falls_back_to_defaults() {
        let cfg: RuntimeConfig = serde_json::from_value(json!({
            "defaults": {"max_threads": 2},
            "stages": {
                "parse": {"queue_capacity": 64, "init_args": {"mode": "strict"}}
            }
        }))
        .expect("deserialize");

        let parse = cfg.stage_config("parse");
        assert_eq!(parse.capacity(), Some(64));
        assert_eq!(parse.init_args.get_string("mode").as_deref(), Some("strict"));
        assert_eq!(cfg.stage_config("other").max_threads, 2);
        assert!(cfg.socket.is_none());
    }
}
