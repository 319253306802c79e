//! Retry Policy
//!
//! Linear backoff for dials, reconnects and credential calls: the n-th retry
//! waits `n × unit`, capped at `max_delay`, optionally randomized by a jitter
//! factor. After `max_retries` retries the policy yields nothing and the
//! caller gives up.

use std::time::Duration;

use rand::Rng;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay step: retry `n` waits `n × unit`.
    pub unit: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Number of retries after the first attempt.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            unit: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            max_retries: 100,
        }
    }
}

impl RetryConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(unit: Duration, max_delay: Duration, jitter_factor: f64, max_retries: u32) -> Self {
        Self {
            unit,
            max_delay,
            jitter_factor,
            max_retries,
        }
    }

    /// Same policy with a different step.
    #[must_use]
    pub const fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Start a fresh policy from this configuration.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.clone())
    }
}

/// Stateful retry counter for one retry procedure.
///
/// # Example
///
/// ```rust
/// use venue_stream::infrastructure::venue::backoff::{RetryConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let mut policy = RetryPolicy::new(RetryConfig::new(
///     Duration::from_millis(100),
///     Duration::from_secs(1),
///     0.0,
///     2,
/// ));
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
/// assert_eq!(policy.next_delay(), None);
/// ```
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    retries: u32,
}

impl RetryPolicy {
    /// Create a new retry policy.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// Get the delay before the next retry.
    ///
    /// Returns `None` if the retry cap has been reached.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }

        self.retries += 1;

        let base = self
            .config
            .unit
            .saturating_mul(self.retries)
            .min(self.config.max_delay);

        Some(self.apply_jitter(base))
    }

    /// Number of retries handed out so far.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Check if another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.retries < self.config.max_retries
    }

    /// Reset after a success.
    pub const fn reset(&mut self) {
        self.retries = 0;
    }

    /// Apply jitter to a duration.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || duration.is_zero() {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
