//! Per-stage service statistics.

use crate::config::StatsConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shortest service time a window is credited with, so idle-fast windows do
/// not divide by zero.
const MIN_WINDOW_SECS: f64 = 1.0e-3;

struct Estimator {
    service_rate: f64,
    rt90_ms: f64,
    rt90_seeded: bool,
    window_start: Instant,
    window_samples: u32,
    window_events: u64,
    window_time: Duration,
}

/// Smoothed throughput and latency estimates for one stage.
///
/// Fed by the scheduling loop after every handler invocation and read by the
/// controller once per decision interval.
pub struct StageStats {
    name: String,
    cfg: StatsConfig,
    est: Mutex<Estimator>,
    latency: Mutex<LatencySampler>,
    total_events: AtomicU64,
    faults: AtomicU64,
}

/// Point-in-time copy for monitoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub service_rate: f64,
    pub rt90_ms: f64,
    pub total_events: u64,
    pub faults: u64,
}

impl StageStats {
    pub fn new(name: impl Into<String>, cfg: StatsConfig) -> Self {
        let latency = LatencySampler::new(cfg.latency_samples);
        Self {
            name: name.into(),
            cfg,
            est: Mutex::new(Estimator {
                service_rate: 0.0,
                rt90_ms: 0.0,
                rt90_seeded: false,
                window_start: Instant::now(),
                window_samples: 0,
                window_events: 0,
                window_time: Duration::ZERO,
            }),
            latency: Mutex::new(latency),
            total_events: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    /// Account `events` processed in `elapsed` of service time.
    ///
    /// When the window closes (enough samples or enough wall-clock time) the
    /// window rate is folded into the smoothed rate:
    /// `smoothed = a * rate + (1 - a) * smoothed`.
    pub fn record_service_rate(&self, events: usize, elapsed: Duration) {
        self.total_events
            .fetch_add(events as u64, Ordering::Relaxed);

        let mut est = self.est.lock();
        est.window_events += events as u64;
        est.window_time += elapsed;
        est.window_samples += 1;

        let window = Duration::from_millis(self.cfg.estimation_window_ms);
        if est.window_samples < self.cfg.estimation_samples.max(1)
            && est.window_start.elapsed() < window
        {
            return;
        }

        let secs = est.window_time.as_secs_f64().max(MIN_WINDOW_SECS);
        let rate = est.window_events as f64 / secs;
        let alpha = self.cfg.smoothing_alpha;
        est.service_rate = alpha * rate + (1.0 - alpha) * est.service_rate;

        tracing::trace!(
            "[{}] window events={} time={:?} rate={:.1} smoothed={:.1}",
            self.name,
            est.window_events,
            est.window_time,
            rate,
            est.service_rate
        );

        est.window_start = Instant::now();
        est.window_samples = 0;
        est.window_events = 0;
        est.window_time = Duration::ZERO;
    }

    /// Record one handler invocation: service rate plus a latency sample.
    pub fn record_batch(&self, events: usize, elapsed: Duration) {
        self.record_service_rate(events, elapsed);
        self.latency.lock().record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Store a caller-computed 90th percentile response time (ms), smoothed
    /// with the same factor as the service rate. The first sample seeds it.
    pub fn record_90th_rt(&self, sample_ms: f64) {
        let mut est = self.est.lock();
        if est.rt90_seeded {
            let alpha = self.cfg.smoothing_alpha;
            est.rt90_ms = alpha * sample_ms + (1.0 - alpha) * est.rt90_ms;
        } else {
            est.rt90_ms = sample_ms;
            est.rt90_seeded = true;
        }
    }

    pub fn get_90th_rt(&self) -> f64 {
        self.est.lock().rt90_ms
    }

    pub fn service_rate(&self) -> f64 {
        self.est.lock().service_rate
    }

    /// Percentile over the recent per-batch latency ring, in ms.
    pub fn latency_percentile(&self, p: f64) -> Option<f64> {
        self.latency.lock().percentile(p)
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let est = self.est.lock();
        StatsSnapshot {
            service_rate: est.service_rate,
            rt90_ms: est.rt90_ms,
            total_events: self.total_events(),
            faults: self.faults(),
        }
    }

    /// Drop all estimates and counters.
    pub fn reset(&self) {
        let mut est = self.est.lock();
        est.service_rate = 0.0;
        est.rt90_ms = 0.0;
        est.rt90_seeded = false;
        est.window_start = Instant::now();
        est.window_samples = 0;
        est.window_events = 0;
        est.window_time = Duration::ZERO;
        drop(est);
        self.latency.lock().clear();
        self.total_events.store(0, Ordering::Relaxed);
        self.faults.store(0, Ordering::Relaxed);
    }
}

/// Fixed-size ring of recent latency samples (ms).
pub struct LatencySampler {
    samples: VecDeque<f64>,
    cap: usize,
}

impl LatencySampler {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn record(&mut self, ms: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    /// Nearest-rank percentile, `p` in `[0, 1]`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_call_window() -> StatsConfig {
        StatsConfig {
            estimation_samples: 1,
            ..StatsConfig::default()
        }
    }

    #[test]
    fn smoothed_rate_converges_to_sustained_rate() {
        let stats = StageStats::new("conv", per_call_window());
        // 100 events per 100ms window -> 1000 events/s
        for _ in 0..10 {
            stats.record_service_rate(100, Duration::from_millis(100));
        }
        let rate = stats.service_rate();
        assert!((rate - 1000.0).abs() / 1000.0 < 0.05, "rate = {rate}");
        assert_eq!(stats.total_events(), 1000);
    }

    #[test]
    fn first_window_applies_alpha() {
        let stats = StageStats::new("alpha", per_call_window());
        stats.record_service_rate(50, Duration::from_millis(100));
        assert!((stats.service_rate() - 350.0).abs() < 1e-6);
    }

    #[test]
    fn window_waits_for_sample_threshold() {
        let cfg = StatsConfig {
            estimation_samples: 3,
            estimation_window_ms: 60_000,
            ..StatsConfig::default()
        };
        let stats = StageStats::new("window", cfg);
        stats.record_service_rate(10, Duration::from_millis(10));
        stats.record_service_rate(10, Duration::from_millis(10));
        assert_eq!(stats.service_rate(), 0.0);
        stats.record_service_rate(10, Duration::from_millis(10));
        // 30 events in 30ms -> 1000/s, smoothed once
        assert!((stats.service_rate() - 700.0).abs() < 1e-6);
    }

    #[test]
    fn zero_service_time_is_clamped() {
        let stats = StageStats::new("zero", per_call_window());
        stats.record_service_rate(1, Duration::ZERO);
        assert!(stats.service_rate().is_finite());
        assert!((stats.service_rate() - 700.0).abs() < 1e-6);
    }

    #[test]
    fn rt90_is_seeded_then_smoothed() {
        let stats = StageStats::new("rt", StatsConfig::default());
        stats.record_90th_rt(10.0);
        assert_eq!(stats.get_90th_rt(), 10.0);
        stats.record_90th_rt(20.0);
        assert!((stats.get_90th_rt() - 17.0).abs() < 1e-9);
    }

    #[test]
    fn sampler_percentile_and_ring() {
        let mut s = LatencySampler::new(10);
        assert!(s.percentile(0.9).is_none());
        for ms in 1..=10 {
            s.record(ms as f64);
        }
        assert_eq!(s.percentile(0.9), Some(9.0));
        assert_eq!(s.percentile(1.0), Some(10.0));
        s.record(100.0);
        assert_eq!(s.len(), 10);
        assert_eq!(s.percentile(0.0), Some(2.0));
    }

    #[test]
    fn reset_clears_everything() {
        let stats = StageStats::new("reset", per_call_window());
        stats.record_batch(5, Duration::from_millis(5));
        stats.record_fault();
        stats.reset();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                service_rate: 0.0,
                rt90_ms: 0.0,
                total_events: 0,
                faults: 0
            }
        );
        assert!(stats.latency_percentile(0.9).is_none());
    }
}
