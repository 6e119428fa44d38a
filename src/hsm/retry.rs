//! Retry logic for transient HSM failures.
//!
//! Retries use exponential backoff with jitter:
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0-50% of the computed delay is added so that callers
//!   waiting on the same device do not retry in lockstep

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::hsm::HsmError;

/// Executes `operation` until it succeeds, fails permanently, or
/// `max_attempts` is reached. Returns the outcome and the number of
/// attempts made.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> (Result<T, HsmError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, HsmError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "operation succeeded after retry",
                    );
                }
                return (Ok(value), attempt);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = compute_backoff(config, attempt - 1);
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %err,
                        "retries exhausted",
                    );
                }
                return (Err(err), attempt);
            }
        }
    }
}

pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config
        .initial_backoff()
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff());

    // Add jitter: 0-50% of the computed delay
    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::thread_rng().gen_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig { max_attempts, initial_backoff_ms: 1, max_backoff_ms: 4 }
    }

    #[test]
    fn test_compute_backoff_is_capped() {
        let config = RetryConfig { max_attempts: 10, initial_backoff_ms: 100, max_backoff_ms: 400 };
        for attempt in 0..10 {
            let delay = compute_backoff(&config, attempt);
            assert!(delay <= Duration::from_millis(600), "attempt {} gave {:?}", attempt, delay);
        }
        let first = compute_backoff(&config, 0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = with_retry(&config(5), "sign", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(HsmError::Unavailable("link down".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = with_retry(&config(5), "sign", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HsmError::KeyNotFound("h1".into())) }
        })
        .await;
        assert!(matches!(result, Err(HsmError::KeyNotFound(_))));
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let (result, attempts) = with_retry(&config(3), "sign", |_| async {
            Err::<(), _>(HsmError::Session("reset".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }
}
