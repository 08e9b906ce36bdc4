//! Bounded retry with backoff, shared by execution retries and event
//! redelivery.

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// base * 2^(attempt - 1), capped at `max_delay`.
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Spread applied to each delay, 0.0 to 1.0.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
            jitter: 0.1,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
            jitter: 0.0,
        }
    }

    /// Execution re-dispatch: 3 attempts, 1s doubling to at most 60s.
    pub fn execution_default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Event redelivery: 5 attempts, 2s doubling to at most 5 minutes.
    pub fn delivery_default() -> Self {
        Self::exponential(5, Duration::from_secs(2), Duration::from_secs(300))
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.backoff {
            Backoff::Fixed => base_ms,
            Backoff::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(32) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic spread so that retries of one batch do not align.
        let spread = delay_ms * self.jitter;
        let offset = if spread > 0.0 {
            let unit = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            spread * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + offset).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    /// May another attempt follow `attempts` failed ones?
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Absolute time of the next attempt after `attempts` failures.
    pub fn next_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
        now + delay
    }
}
