//! Retry with exponential backoff.
//!
//! This is the only retry loop in the crate: the optimizer never retries and
//! [`crate::query::Query`] delegates here with its own policy.

use crate::config::RetryPolicy;
use crate::error::ApiError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Maximum safe backoff (1 day); anything longer is a misconfiguration.
const MAX_BACKOFF_SECS: f64 = 86_400.0;

/// Backoff before retry number `attempt + 1` (0-based).
///
/// `min(initial_delay * backoff_factor^attempt, max_delay)`, plus up to 25%
/// jitter when enabled, never exceeding `max_delay`. Non-finite or negative
/// inputs are sanitized instead of panicking in `Duration::from_secs_f64`.
#[must_use]
pub fn calculate_backoff(policy: &RetryPolicy, attempt: usize) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);

    let factor = if policy.backoff_factor.is_finite() && policy.backoff_factor >= 0.0 {
        policy.backoff_factor
    } else {
        1.0
    };
    let max_secs = policy.max_delay.as_secs_f64().min(MAX_BACKOFF_SECS);

    let raw = policy.initial_delay.as_secs_f64() * factor.powi(exponent);
    let clamped = if raw.is_finite() {
        raw.clamp(0.0, max_secs)
    } else {
        max_secs
    };
    let delay = Duration::from_secs_f64(clamped);

    let delay = if policy.jitter {
        let jitter_factor = rand::rng().random_range(0.0..=0.25);
        delay + delay.mul_f64(jitter_factor)
    } else {
        delay
    };

    delay.min(Duration::from_secs_f64(max_secs))
}

/// Delay before the next attempt; a server `Retry-After` hint wins when the
/// policy allows it, still capped at `max_delay`.
fn next_delay(policy: &RetryPolicy, attempt: usize, err: &ApiError) -> Duration {
    match err.retry_after() {
        Some(hint) if policy.respect_retry_after => hint.min(policy.max_delay),
        _ => calculate_backoff(policy, attempt),
    }
}

/// Run `op`, retrying retryable failures with backoff.
///
/// Non-retryable errors are returned immediately. After `max_retries`
/// retries the last error is returned.
///
/// # Errors
/// The first non-retryable error, or the last error once retries run out.
pub async fn execute_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if attempt < policy.max_retries && err.is_retryable(&policy.retryable_statuses) =>
            {
                let delay = next_delay(policy, attempt, &err);
                attempt += 1;
                tracing::debug!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, error = %err, "giving up");
                }
                return Err(err);
            }
        }
    }
}
