//! Stage task implementations for the worker pool.

mod metadata;
mod persist;
mod title;

pub use metadata::MetadataTask;
pub use persist::PersistTask;
pub use title::{parse_title, TitleTask};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff policy for transient failures within a stage task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial delay before the first retry.
    pub base_delay_ms: u64,
    /// Ceiling on the delay between retries.
    pub max_delay_ms: u64,
    /// Attempts before the item is parked, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // Base 2 s, cap 60 s, six attempts.
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-indexed), or `None`
    /// once the attempt budget is spent.
    pub fn delay_after_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(delay_ms))
    }
}
