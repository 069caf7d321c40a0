//! Retry policy for backend cancellation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cancellation is attempted at most this many times.
pub const CANCEL_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Retry immediately.
    #[default]
    None,
    /// Same delay before every retry.
    Fixed,
    /// base * attempt
    Linear,
}

/// Delay between cancellation attempts.
///
/// The number of attempts is not configurable; only the pause between them
/// is, and it is capped by `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRetryPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for CancelRetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

impl CancelRetryPolicy {
    pub fn immediate() -> Self {
        Self {
            strategy: BackoffStrategy::None,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        CANCEL_ATTEMPTS
    }

    /// Pause after failed attempt number `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 || attempt >= CANCEL_ATTEMPTS {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }
}
