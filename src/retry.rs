//! Retry policy with linear or exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::SyncError;

/// Backoff growth strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * 2^(attempt - 1)`
    Exponential,
}

/// Bounded retry policy shared by the query coordinator and the sync queue.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Add random jitter to each delay (±30%).
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryOptions {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub(crate) fn delay_after(&self, attempt: u32) -> Duration {
        let factor = match self.backoff {
            Backoff::Linear => u128::from(attempt),
            Backoff::Exponential => 1u128 << attempt.saturating_sub(1).min(32),
        };
        let millis = (self.base_delay.as_millis().saturating_mul(factor))
            .min(self.max_delay.as_millis());
        let base = Duration::from_millis(millis as u64);
        if self.jitter {
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
            Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
        } else {
            base
        }
    }
}

/// Execute an operation under the given policy.
///
/// Stops early on a non-retryable error. After exhausting the attempt
/// budget the last error is wrapped in [`SyncError::RetriesExhausted`].
pub(crate) async fn with_retry<F, Fut, T>(options: &RetryOptions, mut f: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= max_attempts {
                    if max_attempts > 1 {
                        warn!(attempts = attempt, error = %e, "Retries exhausted");
                        return Err(SyncError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    return Err(e);
                }
                let delay = options.delay_after(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
