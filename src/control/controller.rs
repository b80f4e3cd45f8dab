use crate::config::ControllerConfig;
use crate::control::inputs::{ControllerInputs, Decision};
use crate::control::policy::Policy;

/// Response-time controller for one stage's thread pool.
///
/// Threads: grow by one after `sustain_intervals` consecutive intervals with
/// the queue at or above `high_water`, shrink by one after as many intervals
/// at or below `low_water`. Both are bounded by `[min_threads, max_threads]`
/// and a change resets both streaks.
///
/// Batch (only with `tune_batch`): halve toward `batch_min` while p90 exceeds
/// the target; double toward `batch_max` while p90 is under it and the queue
/// is backed up.
#[derive(Debug, Clone)]
pub struct ResponseTimeController {
    cfg: ControllerConfig,
    min_threads: usize,
    max_threads: usize,
    high_streak: u32,
    idle_streak: u32,
}

impl ResponseTimeController {
    pub fn new(cfg: ControllerConfig, min_threads: usize, max_threads: usize) -> Self {
        Self {
            cfg,
            min_threads: min_threads.max(1),
            max_threads: max_threads.max(min_threads.max(1)),
            high_streak: 0,
            idle_streak: 0,
        }
    }

    fn thread_delta(&mut self, inputs: &ControllerInputs) -> i8 {
        let sustain = self.cfg.sustain_intervals.max(1);

        if inputs.queue_len >= self.cfg.high_water {
            self.high_streak += 1;
            self.idle_streak = 0;
        } else if inputs.queue_len <= self.cfg.low_water {
            self.idle_streak += 1;
            self.high_streak = 0;
        } else {
            self.high_streak = 0;
            self.idle_streak = 0;
        }

        if self.high_streak >= sustain && inputs.threads < self.max_threads {
            self.high_streak = 0;
            return 1;
        }
        if self.idle_streak >= sustain && inputs.threads > self.min_threads {
            self.idle_streak = 0;
            return -1;
        }
        0
    }

    fn batch_target(&self, inputs: &ControllerInputs) -> Option<usize> {
        if !self.cfg.tune_batch {
            return inputs.batch_target;
        }
        let lo = self.cfg.batch_min.max(1);
        let hi = self.cfg.batch_max.max(lo);
        let current = inputs.batch_target.unwrap_or(hi).clamp(lo, hi);

        // no samples yet
        if inputs.rt90_ms <= 0.0 {
            return Some(current);
        }
        if inputs.rt90_ms > self.cfg.target_latency_ms {
            Some((current / 2).max(lo))
        } else if inputs.queue_len >= self.cfg.high_water {
            Some(current.saturating_mul(2).min(hi))
        } else {
            Some(current)
        }
    }
}

impl Policy for ResponseTimeController {
    fn decide(&mut self, inputs: &ControllerInputs) -> Decision {
        Decision {
            thread_delta: self.thread_delta(inputs),
            batch_target: self.batch_target(inputs),
        }
    }
}
