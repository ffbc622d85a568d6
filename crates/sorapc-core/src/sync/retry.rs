//! Retry with exponential backoff for transient network failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::report::SyncError;
use crate::config::RetryPolicy;
use crate::error::RemoteError;

/// Delay before retry number `attempt` (1-based), with up to 20% jitter.
pub(crate) fn backoff_with_jitter(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let backoff = policy
        .base_backoff_ms
        .saturating_mul(1_u64 << exp)
        .min(policy.max_backoff_ms);
    let jitter = rand::thread_rng().gen_range(0..=(backoff / 5).max(1));
    Duration::from_millis(backoff.saturating_add(jitter))
}

/// Runs `op` until it succeeds, fails permanently, runs out of attempts or
/// `cancel` fires.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
            result = op() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = backoff_with_jitter(policy, attempt);
                debug!(attempt, ?delay, "Transient failure, retrying: {err}");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(SyncError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(SyncError::from_remote(err, attempt)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = policy();
        let first = backoff_with_jitter(&policy, 1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(120));

        let third = backoff_with_jitter(&policy, 3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(480));

        let capped = backoff_with_jitter(&policy, 30);
        assert!(capped >= Duration::from_millis(1_000) && capped <= Duration::from_millis(1_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&policy(), &CancellationToken::new(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RemoteError::TransientNetwork("timeout".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_capped() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&policy(), &CancellationToken::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::TransientNetwork("down".into()))
        })
        .await;

        assert!(matches!(
            result,
            Err(SyncError::TransientNetwork { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&policy(), &CancellationToken::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Auth("expired".into()))
        })
        .await;

        assert!(matches!(result, Err(SyncError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = with_retry(&policy(), &cancel, || async { Ok::<_, RemoteError>(1) }).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
