//! Reconnection backoff
//!
//! Capped exponential backoff with optional jitter, driven by the connect loop.
//! Attempts are unlimited; only a disconnect stops the loop.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    /// Whether to add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    /// Create from configuration values
    pub fn from_millis(initial_delay_ms: u64, max_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            backoff_multiplier,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after `failures` consecutive failed attempts
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;

        // delay = initial_delay * (multiplier ^ (failures - 1))
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let mut delay = if factor.is_finite() {
            self.policy_mul(factor)
        } else {
            self.max_delay
        };

        if delay > self.max_delay {
            delay = self.max_delay;
        }

        if self.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }

    fn policy_mul(&self, factor: f64) -> Duration {
        let secs = self.initial_delay.as_secs_f64() * factor;
        if secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Backoff state owned by a single connect loop
///
/// Each loop starts from a fresh `Backoff`, so a repeated connect request
/// that is ignored never resets the delay of the loop already running.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u64,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            failures: 0,
        }
    }

    /// Record the start of an attempt and return its 1-based number
    pub fn begin_attempt(&mut self) -> u64 {
        self.attempts += 1;
        self.attempts
    }

    /// Record a failed attempt and return how long to wait before the next one
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.policy.delay_for(self.failures);
        debug!(
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "Backing off before next connect attempt"
        );
        delay
    }
}
