use std::future::Future;
use std::time::Duration;

use crate::app_error::{AppError, AppResult};

/// Retry settings for outbound provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

/// Runs `call` until it succeeds, fails with a non-transient error, or the
/// retry budget is spent. Only `ProviderUnavailable` is treated as transient;
/// client errors are returned on the first attempt.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempts: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && attempts < policy.max_retries => {
                let delay = calculate_backoff_delay(attempts, policy.base_delay_ms, policy.max_delay_ms);
                tracing::warn!(
                    operation = operation,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying provider call after transient error"
                );
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn is_transient(error: &AppError) -> bool {
    matches!(error, AppError::ProviderUnavailable(_))
}

/// Exponential backoff (`base * 2^attempt`, capped) plus up to 25% jitter.
pub fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    let jitter = if delay_ms > 0 {
        rand::random::<u64>() % (delay_ms / 4 + 1)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn backoff_delay_increases_exponentially() {
        let d0 = calculate_backoff_delay(0, 100, 10_000).as_millis();
        let d1 = calculate_backoff_delay(1, 100, 10_000).as_millis();
        let d2 = calculate_backoff_delay(2, 100, 10_000).as_millis();

        assert!((100..=125).contains(&d0));
        assert!((200..=250).contains(&d1));
        assert!((400..=500).contains(&d2));
    }

    #[test]
    fn backoff_delay_is_capped() {
        let d = calculate_backoff_delay(30, 100, 1_000).as_millis();
        assert!((1_000..=1_250).contains(&d));
    }

    #[test]
    fn backoff_delay_zero_base() {
        assert_eq!(calculate_backoff_delay(3, 0, 1_000), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::ProviderUnavailable("503".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let calls = AtomicU32::new(0);
        let result: AppResult<()> = with_retry(&fast_policy(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::InvalidInput("no such price".into())) }
        })
        .await;

        assert!(matches!(result, Err(AppError::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: AppResult<()> = with_retry(&fast_policy(2), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::ProviderUnavailable("timeout".into())) }
        })
        .await;

        assert!(matches!(result, Err(AppError::ProviderUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
