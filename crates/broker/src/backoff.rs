//! Retry backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// `delay * 2^(attempts_made - 1)`
    #[default]
    Exponential,
}

/// Delay policy applied when a job fails and has attempts left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub delay: Duration,
}

/// Exponent cap; keeps the shift well inside `u64` millis.
const MAX_EXPONENT: u32 = 30;

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
        }
    }

    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let base_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = match self.kind {
            BackoffKind::Fixed => base_ms,
            BackoffKind::Exponential => {
                let exp = (attempts_made - 1).min(MAX_EXPONENT);
                base_ms.saturating_mul(1u64 << exp)
            }
        };

        Duration::from_millis(delay_ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(2000))
    }
}
