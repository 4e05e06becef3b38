//! Bounded retry state machine for backend calls
//!
//! `RetryPolicy` holds the limits; `Backoff` walks one call through its
//! attempts. Each failed attempt is fed to [`Backoff::on_failure`], which
//! either hands back the delay before the next attempt or ends the call.

use rand::Rng;
use std::time::Duration;

/// Retry limits for one backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay within `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn start(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            attempt: 1,
        }
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Sleep this long, then make attempt number `attempt`
    RetryAfter { delay: Duration, attempt: u32 },
    /// No more attempts; the last failure is final
    GiveUp,
}

/// Progress of one call through its retry policy.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
}

impl Backoff<'_> {
    /// Attempt currently in flight (1-based)
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Advance after a failure. Non-retryable failures end immediately.
    pub fn on_failure(&mut self, retryable: bool) -> RetryStep {
        if !retryable || self.attempt >= self.policy.max_attempts {
            return RetryStep::GiveUp;
        }

        let delay = self.policy.delay_for(self.attempt);
        let delay = if self.policy.jitter {
            jittered(delay)
        } else {
            delay
        };

        self.attempt += 1;
        RetryStep::RetryAfter {
            delay,
            attempt: self.attempt,
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if millis < 2 {
        return delay;
    }
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}
