use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Throughput over one completed sampling interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub ops: usize,
    pub duration: Duration,
}

impl Sample {
    pub fn op_s(&self) -> f64 {
        self.ops as f64 / self.duration.as_secs_f64()
    }

    pub fn mops(&self) -> f64 {
        self.op_s() / 1e6
    }
}

/// Rolling round-trip counter reporting a rate every `threshold` completions.
#[derive(Debug)]
pub struct ThroughputSampler {
    client: usize,
    threshold: usize,
    completed: usize,
    window_start: Instant,
}

impl ThroughputSampler {
    pub fn new(client: usize, threshold: usize) -> Self {
        assert!(threshold > 0, "threshold must be > 0");
        Self {
            client,
            threshold,
            completed: 0,
            window_start: Instant::now(),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Counts `n` round trips and reports once the threshold is reached.
    ///
    /// Counts arrive a whole window at a time, so when `n` does not divide the
    /// threshold the reported interval overshoots it by less than `n`.
    pub fn record(&mut self, n: usize) -> Option<Sample> {
        self.completed += n;
        if self.completed < self.threshold {
            return None;
        }
        let now = Instant::now();
        self.sample(now)
    }

    fn sample(&mut self, now: Instant) -> Option<Sample> {
        let sample = Sample {
            ops: self.completed,
            duration: now.saturating_duration_since(self.window_start),
        };
        self.completed = 0;
        self.window_start = now;

        if sample.duration.is_zero() {
            warn!(client = self.client, ops = sample.ops, "Sampling interval too short to measure");
            return None;
        }
        info!(
            client = self.client,
            "Client {}: {:.2} Mops",
            self.client,
            sample.mops()
        );
        Some(sample)
    }
}
