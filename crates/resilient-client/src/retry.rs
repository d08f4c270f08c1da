//! Retry policy
//!
//! Exponential backoff with uniform jitter for transient classifications.
//! A 429 with a server hint waits exactly as long as the server asked: the
//! hint is neither capped nor jittered.

use std::time::Duration;

use rand::RngExt;
use transport::ErrorClassification;

use crate::config::RetryConfig;
use crate::descriptor::RequestDescriptor;

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub const STOP: RetryDecision = RetryDecision {
        retry: false,
        delay: Duration::ZERO,
    };

    fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: u8,
    pub rate_limit_default: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries.saturating_add(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_pct: config.jitter_pct.min(100),
            rate_limit_default: Duration::from_millis(config.rate_limit_default_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy with the request's overrides applied.
    pub fn for_descriptor(&self, descriptor: &RequestDescriptor) -> RetryPolicy {
        let mut policy = self.clone();
        if descriptor.skip_retry {
            policy.max_attempts = 1;
            return policy;
        }
        if let Some(retries) = descriptor.max_retries {
            policy.max_attempts = retries.saturating_add(1);
        }
        if let Some(delay) = descriptor.retry_delay {
            policy.base_delay = delay;
        }
        policy
    }

    /// Un-jittered backoff for the attempt that just failed (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide whether attempt number `attempt` should be followed by another.
    pub fn decide(&self, classification: &ErrorClassification, attempt: u32) -> RetryDecision {
        self.decide_with_jitter(classification, attempt, rand::rng().random::<u64>())
    }

    /// Deterministic form of `decide` for a caller-supplied random value.
    pub fn decide_with_jitter(
        &self,
        classification: &ErrorClassification,
        attempt: u32,
        random: u64,
    ) -> RetryDecision {
        if !classification.is_transient() || attempt >= self.max_attempts {
            return RetryDecision::STOP;
        }

        match classification {
            ErrorClassification::RateLimited {
                retry_after: Some(hint),
            } => RetryDecision::after(*hint),
            ErrorClassification::RateLimited { retry_after: None } => {
                RetryDecision::after(self.jitter(self.rate_limit_default, random))
            }
            _ => RetryDecision::after(self.jitter(self.backoff(attempt), random)),
        }
    }

    /// Spread `delay` uniformly over `delay * (1 ± jitter_pct/100)`.
    fn jitter(&self, delay: Duration, random: u64) -> Duration {
        if self.jitter_pct == 0 || delay.is_zero() {
            return delay;
        }
        let nanos = delay.as_nanos().min(u64::MAX as u128) as u64;
        let spread = nanos / 100 * self.jitter_pct as u64;
        if spread == 0 {
            return delay;
        }
        let width = spread.saturating_mul(2).saturating_add(1);
        let offset = random % width;
        Duration::from_nanos(nanos.saturating_sub(spread).saturating_add(offset))
    }
}
