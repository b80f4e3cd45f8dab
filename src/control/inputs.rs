/// What the controller sees once per decision interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerInputs {
    /// Smoothed events/s.
    pub service_rate: f64,
    /// Smoothed p90 batch latency, ms.
    pub rt90_ms: f64,
    pub queue_len: usize,
    pub queue_capacity: Option<usize>,
    pub threads: usize,
    /// Current aggregation target; `None` drains everything.
    pub batch_target: Option<usize>,
}

/// Next scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// -1, 0 or +1, already clamped to the configured thread bounds.
    pub thread_delta: i8,
    pub batch_target: Option<usize>,
}

