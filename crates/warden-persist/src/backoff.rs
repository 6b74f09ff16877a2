//! Exponential backoff with jitter for failed storage writes.

use std::time::Duration;

use rand::Rng;
use warden_config::PersistenceConfig;

/// How often and how patiently a failed write is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed retry.
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Attempts per write, the first one included.
    pub max_attempts: u32,
    /// Jitter factor (0.0 - 1.0), applied as ±jitter to each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PersistenceConfig::default())
    }
}

impl RetryPolicy {
    /// Policy described by the `persistence` config section.
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// A policy that retries immediately, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_attempts: max_attempts.max(1),
            jitter: 0.0,
        }
    }

    /// Fresh backoff state for one write.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            failures: 0,
            current_delay: self.initial_delay,
        }
    }
}

/// Retry state of a single write.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
    current_delay: Duration,
}

impl Backoff {
    /// Records a failed attempt and returns how long to wait before the next
    /// one, or `None` once every attempt has been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            return None;
        }

        let base = self.current_delay;
        let jittered = if self.policy.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.policy.jitter)..=(1.0 + self.policy.jitter));
            scale(base, factor)
        } else {
            base
        };

        let next = scale(self.current_delay, self.policy.backoff_multiplier);
        self.current_delay = next.min(self.policy.max_delay);

        Some(jittered.min(self.policy.max_delay))
    }

    /// Failed attempts so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// `duration × factor`, rounded to the nearest nanosecond.
fn scale(duration: Duration, factor: f64) -> Duration {
    let nanos = (duration.as_nanos() as f64 * factor).round();
    Duration::from_nanos(nanos.clamp(0.0, u64::MAX as f64) as u64)
}
