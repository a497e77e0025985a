//! Job retry policy with exponential backoff.

use std::time::Duration;

use crate::ApiError;

/// Backoff strategy between job attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        max: Duration,
        /// Apply random jitter (+/- 50%) to the delay.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts were made (1-based).
    pub fn delay(self, attempts_made: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max, jitter } => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                let scaled = base.saturating_mul(1_u32 << exponent);
                let mut delay = scaled.min(max);

                if jitter {
                    let jitter_ms = (delay.as_millis() / 2) as u64;
                    let offset = fastrand::u64(0..=(jitter_ms * 2));
                    let total_ms = (delay.as_millis() as u64 + offset).saturating_sub(jitter_ms);
                    delay = Duration::from_millis(total_ms);
                }

                delay
            }
        }
    }
}

/// How often and how patiently a failed job is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base,
                max: Duration::from_secs(30),
                jitter: false,
            },
        }
    }

    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a job that just failed its `attempts_made`-th attempt goes again.
    pub fn should_retry(&self, error: &ApiError, attempts_made: u32) -> bool {
        error.retryable() && attempts_made < self.max_attempts
    }

    /// Backoff before the next attempt; a provider retry hint wins when longer.
    pub fn delay_for(&self, error: &ApiError, attempts_made: u32) -> Duration {
        let delay = self.backoff.delay(attempts_made);
        error
            .retry_after()
            .map_or(delay, |hint| hint.max(delay))
    }
}
