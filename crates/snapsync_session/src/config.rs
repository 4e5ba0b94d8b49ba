//! Configuration for the sync session.

use rand::Rng;
use snapsync_protocol::{Credentials, PROTOCOL_VERSION};
use std::time::Duration;

/// Configuration for one sync session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stable identifier of this device.
    pub device_id: String,
    /// Credentials presented in the handshake.
    pub credentials: Credentials,
    /// Protocol version announced in the handshake.
    pub protocol_version: u16,
    /// How long to wait for `Welcome` after sending `Hello`.
    pub handshake_timeout: Duration,
    /// Log entries read per upload pass.
    pub upload_batch_size: usize,
    /// Compact the log once this many acknowledged entries accumulate.
    pub compact_threshold: Option<u64>,
    /// Reconnect policy.
    pub backoff: BackoffConfig,
}

impl SessionConfig {
    /// Creates a configuration with default timings.
    pub fn new(device_id: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            device_id: device_id.into(),
            credentials,
            protocol_version: PROTOCOL_VERSION,
            handshake_timeout: Duration::from_secs(10),
            upload_batch_size: 64,
            compact_threshold: None,
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the upload batch size.
    pub fn with_upload_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size.max(1);
        self
    }

    /// Enables automatic compaction.
    pub fn with_compact_threshold(mut self, entries: u64) -> Self {
        self.compact_threshold = Some(entries);
        self
    }

    /// Sets the reconnect policy.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Overrides the announced protocol version.
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Relative jitter, `0.2` meaning ±20%.
    pub jitter: f64,
    /// Consecutive failures tolerated. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl BackoffConfig {
    /// 1s initial, ×2, 30s cap, ±20% jitter, unlimited attempts.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the relative jitter, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Bounds consecutive failures.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Returns `true` once `failures` consecutive failures exhaust the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry number `attempt` (1-based), with jitter. Never
    /// exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).min(self.max_delay.as_secs_f64()))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_builder() {
        let config = SessionConfig::new("device-a", Credentials::new("ada", "pw"))
            .with_handshake_timeout(Duration::from_secs(2))
            .with_upload_batch_size(0)
            .with_compact_threshold(100);

        assert_eq!(config.device_id, "device-a");
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.upload_batch_size, 1);
        assert_eq!(config.compact_threshold, Some(100));
        assert!(config.backoff.max_attempts.is_none());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let backoff = BackoffConfig::new();
        assert_eq!(backoff.base_delay(0), Duration::ZERO);
        assert_eq!(backoff.base_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(5), Duration::from_secs(16));
        assert_eq!(backoff.base_delay(6), Duration::from_secs(30));
        assert_eq!(backoff.base_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let backoff = BackoffConfig::new();
        for _ in 0..200 {
            let delay = backoff.delay_for_attempt(3).as_secs_f64();
            assert!((3.19..=4.81).contains(&delay), "delay {delay}");
        }
        for _ in 0..200 {
            assert!(backoff.delay_for_attempt(10) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn no_jitter_is_exact() {
        let backoff = BackoffConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(0.0);
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
    }

    #[test]
    fn attempt_budget() {
        let backoff = BackoffConfig::new();
        assert!(!backoff.exhausted(u32::MAX));
        let backoff = backoff.with_max_attempts(3);
        assert!(!backoff.exhausted(2));
        assert!(backoff.exhausted(3));
    }
}
