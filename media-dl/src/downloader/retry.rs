//! Cancellable retry-with-backoff for driver operations.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::DownloadError;
use crate::domain::RetryPolicy;

/// Run `operation` under `policy`.
///
/// `operation` receives the attempt number: 0 for the first try, `n >= 1` for
/// the n-th retry. An error is retried only when its classification is
/// retryable, its code is eligible under the policy and the attempt budget
/// is not spent. The backoff sleep ends early on cancellation.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    label: &str,
    mut operation: F,
) -> Result<T, DownloadError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => err,
        };

        let next = attempt + 1;
        let Some(delay) = policy.next_delay(&err.to_task_error(), next) else {
            return Err(err);
        };

        warn!(
            op = label,
            attempt = next,
            max = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );

        tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(3, 100, None);
        let token = CancellationToken::new();

        let result = retry_with_backoff(&policy, &token, "test", |attempt| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(DownloadError::timeout("slow"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(2, 10);
        let token = CancellationToken::new();

        let result: Result<(), _> = retry_with_backoff(&policy, &token, "test", |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DownloadError::network("reset"))
            }
        })
        .await;

        assert!(result.is_err());
        // First try plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, 10);
        let token = CancellationToken::new();

        let result: Result<(), _> = retry_with_backoff(&policy, &token, "test", |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DownloadError::DrmProtected {
                    reason: "key".into(),
                })
            }
        })
        .await;

        assert_eq!(result.unwrap_err().to_task_error().code, ErrorCode::DrmProtected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::fixed(5, 60_000);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result: Result<(), _> = retry_with_backoff(&policy, &token, "test", |_| async {
            Err(DownloadError::timeout("slow"))
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
