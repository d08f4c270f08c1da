//! Client configuration
//!
//! Every field has a default so an embedder can deserialize a partial TOML
//! table (or use `ClientConfig::default()`) and override only what it needs.

use std::time::Duration;

use serde::Deserialize;

/// Root client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL request paths are resolved against
    pub base_url: String,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub timeout: TimeoutConfig,
    /// How long a non-offline-eligible request waits for connectivity before failing
    pub connection_wait_ms: u64,
    pub business: BusinessConfig,
    pub refresh: RefreshConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            timeout: TimeoutConfig::default(),
            connection_wait_ms: 5_000,
            business: BusinessConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

/// Backoff settings for transient failures
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Uniform jitter, percent of the computed delay (0-100)
    pub jitter_pct: u8,
    /// Delay for a 429 without a server retry hint
    pub rate_limit_default_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 3,
            jitter_pct: 20,
            rate_limit_default_ms: 5_000,
        }
    }
}

/// Offline queue capacity and replay pacing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    /// Entries replayed concurrently per batch
    pub batch_size: usize,
    /// Pause between replay batches
    pub batch_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            batch_size: 5,
            batch_delay_ms: 1_000,
        }
    }
}

/// Adaptive per-call timeout
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Timeout floor is `average recent RTT * rtt_multiplier`
    pub rtt_multiplier: u32,
    /// Number of recent round trips averaged
    pub sample_window: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_ms: 15_000,
            max_ms: 60_000,
            rtt_multiplier: 4,
            sample_window: 20,
        }
    }
}

/// Detection of application errors embedded in 2xx bodies
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusinessConfig {
    pub code_field: String,
    pub message_field: String,
    pub success_codes: Vec<i64>,
}

impl Default for BusinessConfig {
    fn default() -> Self {
        Self {
            code_field: "code".to_string(),
            message_field: "message".to_string(),
            success_codes: vec![0, 200],
        }
    }
}

/// Proactive background refresh
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    /// Refresh when the advisory expiry is this close
    pub threshold_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            threshold_secs: 300,
        }
    }
}

impl ClientConfig {
    /// Reject values the client cannot operate with.
    pub fn validate(&self) -> common::Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(common::Error::invalid(
                "base_url",
                format!("must start with http:// or https://, got: {}", self.base_url),
            ));
        }
        let positive = [
            ("queue.max_size", self.queue.max_size as u64),
            ("queue.batch_size", self.queue.batch_size as u64),
            ("timeout.base_ms", self.timeout.base_ms),
            ("refresh.interval_secs", self.refresh.interval_secs),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(common::Error::invalid(field, "must be greater than 0"));
        }
        if self.retry.jitter_pct > 100 {
            return Err(common::Error::invalid("retry.jitter_pct", "must be at most 100"));
        }
        Ok(())
    }

    pub fn connection_wait(&self) -> Duration {
        Duration::from_millis(self.connection_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.queue.batch_size, 5);
        assert_eq!(config.connection_wait(), Duration::from_secs(5));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
base_url = "https://api.example.com"

[retry]
max_retries = 5

[queue]
max_size = 10
"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.queue.max_size, 10);
        assert_eq!(config.queue.batch_delay_ms, 1_000);
        assert_eq!(config.business.code_field, "code");
    }

    #[test]
    fn invalid_base_url_rejected() {
        let config = ClientConfig {
            base_url: "api.example.com".into(),
            ..ClientConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("base_url must start with http"), "got: {err}");
    }

    #[test]
    fn zero_queue_size_rejected() {
        let mut config = ClientConfig::default();
        config.queue.max_size = 0;
        assert_eq!(config.validate().unwrap_err().field(), Some("queue.max_size"));
    }

    #[test]
    fn jitter_over_100_rejected() {
        let mut config = ClientConfig::default();
        config.retry.jitter_pct = 101;
        assert!(config.validate().is_err());
    }
}
