//! Reconnect backoff
//!
//! Exponential delay between consecutive failed attempts, capped, with
//! optional ±25% jitter. Attempts never run out; crossing `fatal_after`
//! only changes how loudly the failure is reported.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failure (ms)
    pub initial_delay_ms: u64,
    /// Upper bound on any delay (ms)
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    /// Consecutive failures after which the failure is reported as fatal
    pub fatal_after: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            fatal_after: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Attempt counter driven by a [`BackoffPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Consecutive failures recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// True once the failure count has reached `fatal_after`
    pub fn is_fatal(&self) -> bool {
        self.policy.fatal_after > 0 && self.failures >= self.policy.fatal_after
    }

    /// True exactly on the failure that crosses the fatal threshold
    pub fn just_became_fatal(&self) -> bool {
        self.policy.fatal_after > 0 && self.failures == self.policy.fatal_after
    }

    /// Record a failure and return the delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exponent = self.failures.saturating_sub(1).min(i32::MAX as u32) as i32;

        let max_ms = self.policy.max_delay_ms as f64;
        let base_ms = self.policy.initial_delay_ms as f64 * self.policy.multiplier.powi(exponent);
        let mut delay = if base_ms.is_finite() && base_ms < max_ms {
            Duration::from_millis(base_ms.max(0.0) as u64)
        } else {
            self.policy.max_delay()
        };

        if self.policy.jitter {
            let range = delay.as_millis() as f64 * 0.25;
            if range >= 1.0 {
                let jitter = rand::thread_rng().gen_range(-range..range);
                let ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(ms as u64);
            }
        }

        delay
    }

    /// Forget recorded failures after a success
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
