//! Retry policy for search store writes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay` every time.
    Fixed,
    /// `base_delay` doubled per failed attempt, capped at `max_delay`.
    #[default]
    Exponential,
}

/// Bounds how long a single event may keep a lane busy.
///
/// A retry happens only while both limits hold: fewer than `max_attempts`
/// attempts have been made, and sleeping for the next delay would not push the
/// event past `max_elapsed` since its first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap on a single backoff delay.
    pub max_delay: Duration,
    /// Cap on the whole retry window.
    pub max_elapsed: Duration,
    pub strategy: BackoffStrategy,
    /// Spread applied to each delay, as a fraction of it (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            ..Default::default()
        }
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let cap = self.max_delay.max(self.base_delay);
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor).min(cap)
            }
        };

        // Spread lanes that failed together so they do not retry in lockstep.
        // Deterministic per attempt number.
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return raw;
        }
        let offset = raw.mul_f64(spread * unit_noise(attempt));
        if attempt % 2 == 0 {
            raw.saturating_add(offset).min(cap)
        } else {
            raw.saturating_sub(offset)
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// How long to wait before the next attempt, or `None` when the event
    /// should be given up on.
    pub fn next_delay(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let delay = self.delay_for_attempt(attempt);
        if elapsed.saturating_add(delay) > self.max_elapsed {
            return None;
        }
        Some(delay)
    }
}

/// Value in `[0, 1)` derived from `attempt` (splitmix64 finalizer).
fn unit_noise(attempt: u32) -> f64 {
    let mut z = u64::from(attempt).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}
