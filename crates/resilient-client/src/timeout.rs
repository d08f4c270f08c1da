//! Adaptive per-call timeout
//!
//! Keeps a rolling window of recent round-trip times. The timeout for the next
//! call is `max(base, average * multiplier)`, capped at `max`; uploads get at
//! least twice the base.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::descriptor::RequestDescriptor;

#[derive(Debug)]
pub struct RttTracker {
    samples: Mutex<VecDeque<Duration>>,
    window: usize,
    base: Duration,
    max: Duration,
    multiplier: u32,
}

impl RttTracker {
    pub fn new(config: &TimeoutConfig) -> Self {
        let base = Duration::from_millis(config.base_ms);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(config.sample_window)),
            window: config.sample_window.max(1),
            base,
            max: Duration::from_millis(config.max_ms).max(base),
            multiplier: config.rtt_multiplier.max(1),
        }
    }

    /// Record the round trip of a call that reached the server.
    pub fn record(&self, rtt: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(rtt);
    }

    pub fn average(&self) -> Option<Duration> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / samples.len() as u32)
    }

    /// Timeout for an ordinary call given current network conditions.
    pub fn current(&self) -> Duration {
        let adaptive = self
            .average()
            .map(|avg| avg.saturating_mul(self.multiplier))
            .unwrap_or(Duration::ZERO);
        adaptive.max(self.base).min(self.max)
    }

    /// Timeout for one attempt of `descriptor`; an explicit override wins.
    pub fn timeout_for(&self, descriptor: &RequestDescriptor) -> Duration {
        if let Some(timeout) = descriptor.timeout {
            return timeout;
        }
        let current = self.current();
        if descriptor.upload {
            current.max(self.base.saturating_mul(2))
        } else {
            current
        }
    }
}
