//! Bounded retry with exponential backoff
//!
//! Only errors for which [`FetchError::is_retryable`] holds are retried.
//! Anything else is returned immediately, as is the last error once the
//! policy's attempts are used up.

use crate::error::FetchError;
use partfetch_types::RetryPolicy;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Delay before retry number `attempt` (1-based), with jitter if enabled
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay(attempt);
    if !policy.jitter || base.is_zero() {
        return base;
    }
    // Up to 25% either way
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    base.mul_f64(factor)
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts
///
/// `op` receives the 1-based attempt number. Backoff sleeps are cut short by
/// `cancel`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = retry_delay(policy, attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    what, attempt, max_attempts, e, delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
