use crate::error::{StorageError, StorageResult};
/// Resilience Module
///
/// Retry and timeout helpers used by the protocol's dial loop (`StartHandshake`)
/// and its handshake-echo wait (`AcceptProposal`). Both loops must also observe
/// cooperative cancellation (§5), so `poll_until_cancelable` folds a
/// `CancellationToken` check into the poll.
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Retry configuration for resilient operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry a future operation with exponential backoff.
pub async fn retry_async<F, Fut, T>(
    operation: F,
    config: RetryConfig,
    operation_name: &str,
) -> StorageResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = StorageResult<T>>,
{
    let mut delay = config.initial_delay;
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        debug!(
            "attempting {} (attempt {}/{})",
            operation_name, attempt, config.max_attempts
        );

        let start = Instant::now();
        match operation().await {
            Ok(result) => {
                debug!(
                    "{} succeeded on attempt {} after {:?}",
                    operation_name,
                    attempt,
                    start.elapsed()
                );
                return Ok(result);
            }
            Err(e) => {
                last_error = Some(e);
                if attempt < config.max_attempts {
                    warn!(
                        "{} failed on attempt {}, retrying in {:?}: {}",
                        operation_name,
                        attempt,
                        delay,
                        last_error.as_ref().unwrap()
                    );
                    sleep(delay).await;
                    delay = std::cmp::min(
                        Duration::from_millis(
                            (delay.as_millis() as f64 * config.backoff_multiplier) as u64,
                        ),
                        config.max_delay,
                    );
                } else {
                    error!(
                        "{} failed after {} attempts: {}",
                        operation_name,
                        config.max_attempts,
                        last_error.as_ref().unwrap()
                    );
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| StorageError::Generic("retry failed with no error".to_string())))
}

/// Poll `condition` at `interval` until it returns `Some`, `deadline` elapses, or
/// `cancel` fires. Used by `AcceptProposal`'s wait for a `request-replica` echo
/// and `StartHandshake`'s wait for a dialed peer to become reachable, both are
/// blocking polls in the original design (§9) that must still observe
/// cancellation cooperatively (§5).
pub async fn poll_until_cancelable<F, T>(
    mut condition: F,
    interval: Duration,
    deadline: Duration,
    cancel: &CancellationToken,
) -> StorageResult<T>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = condition() {
            return Ok(value);
        }
        if start.elapsed() >= deadline {
            return Err(StorageError::HandshakeTimeout(format!(
                "poll exceeded {:?}",
                deadline
            )));
        }
        tokio::select! {
            _ = sleep(interval) => {}
            _ = cancel.cancelled() => {
                return Err(StorageError::Canceled("poll canceled".to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_async_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_async(
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(StorageError::PeerUnreachable("not yet".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 1.0,
            },
            "test_op",
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_cancelable_times_out() {
        let cancel = CancellationToken::new();
        let result: StorageResult<()> = poll_until_cancelable(
            || None,
            Duration::from_millis(1),
            Duration::from_millis(10),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(StorageError::HandshakeTimeout(_))));
    }

    #[tokio::test]
    async fn poll_until_cancelable_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: StorageResult<()> = poll_until_cancelable(
            || None,
            Duration::from_millis(50),
            Duration::from_secs(5),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(StorageError::Canceled(_))));
    }
}
