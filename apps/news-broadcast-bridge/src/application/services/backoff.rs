//! Reconnection Backoff
//!
//! Capped exponential backoff with jitter for broker reconnection. The
//! supervisor owns one policy and asks it for a decision after every failed
//! or unexpectedly closed subscription.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any delay, jitter included.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Consecutive failures before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    /// Create configuration from `ReconnectSettings`.
    #[must_use]
    pub const fn from_settings(settings: &crate::ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.delay_initial,
            max_delay: settings.delay_max,
            multiplier: 2.0,
            jitter_factor: settings.jitter_factor,
            max_attempts: settings.max_attempts,
        }
    }
}

/// What the supervisor should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then try again.
    Retry {
        /// Consecutive failure count, 1-based.
        attempt: u32,
        /// How long to wait.
        delay: Duration,
    },
    /// Give up until demand is re-established.
    Exhausted {
        /// Consecutive failures observed.
        attempts: u32,
    },
}

/// Backoff policy implementing capped exponential growth with jitter.
///
/// # Example
///
/// ```rust
/// use news_broadcast_bridge::application::services::backoff::{
///     BackoffConfig, BackoffPolicy, RetryDecision,
/// };
/// use std::time::Duration;
///
/// let mut policy = BackoffPolicy::new(BackoffConfig {
///     jitter_factor: 0.0,
///     ..BackoffConfig::default()
/// });
///
/// assert_eq!(
///     policy.record_failure(),
///     RetryDecision::Retry { attempt: 1, delay: Duration::from_secs(1) }
/// );
///
/// // Subscription became active again
/// policy.reset();
/// assert_eq!(policy.failures(), 0);
/// ```
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    current_delay: Duration,
    failures: u32,
}

impl BackoffPolicy {
    /// Create a new backoff policy.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.initial_delay.min(config.max_delay);
        Self {
            config,
            current_delay,
            failures: 0,
        }
    }

    /// Register one failure and decide whether to retry.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);

        if self.config.max_attempts > 0 && self.failures >= self.config.max_attempts {
            return RetryDecision::Exhausted {
                attempts: self.failures,
            };
        }

        let delay = self.apply_jitter(self.current_delay).min(self.config.max_delay);
        self.advance();

        RetryDecision::Retry {
            attempt: self.failures,
            delay,
        }
    }

    /// Reset after a successful subscription or a fresh start.
    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay.min(self.config.max_delay);
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Access the policy configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    fn advance(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
