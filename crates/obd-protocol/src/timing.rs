//! Response-latency tracking

use std::collections::VecDeque;
use std::time::Duration;

/// Timeout derived from recent response latencies.
///
/// Next timeout = `min(max(base, p95 * margin), max)`.
#[derive(Debug, Clone)]
pub struct AdaptiveTimeout {
    base: Duration,
    max: Duration,
    margin: f64,
    window: usize,
    latencies: VecDeque<Duration>,
}

impl AdaptiveTimeout {
    pub fn new(base: Duration, max: Duration, margin: f64, window: usize) -> Self {
        Self {
            base,
            max: max.max(base),
            margin: margin.max(1.0),
            window: window.max(1),
            latencies: VecDeque::with_capacity(window.max(1)),
        }
    }

    /// Record the latency of a successful exchange
    pub fn record(&mut self, latency: Duration) {
        if self.latencies.len() == self.window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    /// 95th percentile of the window (nearest rank)
    pub fn p95(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted.get(rank.saturating_sub(1)).copied()
    }

    pub fn current(&self) -> Duration {
        let scaled = self
            .p95()
            .map(|p| p.mul_f64(self.margin))
            .unwrap_or(self.base);
        scaled.max(self.base).min(self.max)
    }

    pub fn samples(&self) -> usize {
        self.latencies.len()
    }

    pub fn reset(&mut self) {
        self.latencies.clear();
    }
}
