//! Bounded exponential backoff for calls against the rate-limited model.
//!
//! Only [`GenerationError::TransientCapacity`] is retried. Every other
//! error is returned after the first attempt so that bad input or auth
//! failures surface immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{GenerationError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..jitter_ms) };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable
    /// error, or `max_attempts` is reached. Cancellation wins over both
    /// an in-flight attempt and a pending backoff sleep.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                r = operation() => r,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            attempt += 1;
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            let delay = self.delay_for(attempt - 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "⏳ Gemini API busy, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
