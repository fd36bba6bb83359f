//! Retry policy
//!
//! Backoff is described as data and executed with `tokio` timers that race
//! a cancellation token, so an in-flight batch can be stopped cleanly
//! between attempts. Every model call also carries a hard deadline.
//!
//! Author: hephaex@gmail.com

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vg_core::{ExtractionConfig, Result, VgError};

/// Retry policy with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Self::default()
        }
    }

    /// Policy without sleeping, for tests and dry runs
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 2.0,
        }
    }

    /// Delay after the zero-based `attempt` failed: 1s, 2s, 4s, ... capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Whether another attempt follows the zero-based `attempt`
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

/// Sleep for `delay` unless the token fires first
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(VgError::Cancelled)
        } else {
            Ok(())
        };
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(VgError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `fut` under a hard deadline, also racing the cancellation token
pub async fn with_deadline<T, F>(deadline: Duration, cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VgError::Cancelled),
        outcome = tokio::time::timeout(deadline, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(VgError::Timeout(deadline)),
        },
    }
}
