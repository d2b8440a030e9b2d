/// Retry Loop with Exponential Backoff
///
/// Wraps a fallible async operation and retries it while the error classifies
/// as retryable. Backoff doubles from the base, caps at the maximum, and
/// carries jitter so a fleet of callers does not stampede a recovering
/// provider. Provider-quota errors (429/5xx) run the same schedule stretched
/// by QUOTA_BACKOFF_FACTOR. No retry starts once the shutdown token is
/// cancelled.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::constants::{QUOTA_BACKOFF_FACTOR, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS};
use crate::error::{backoff_delay, Error, ErrorClass};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max: Duration::from_millis(RETRY_MAX_DELAY_MS),
        }
    }
}

/// Run `op`, retrying transient failures up to the policy's attempt budget.
///
/// Non-retryable errors surface immediately; exhausting the budget surfaces
/// `RetriesExhausted` carrying the final error. Returns `Error::Shutdown`
/// instead of sleeping when the token fires.
pub async fn with_retries<F, Fut, T>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        if shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }

                let (class, _) = e.classify();
                let delay = delay_for(policy, class, attempt);
                let jitter_ms = if delay.as_millis() > 1 {
                    rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2)
                } else {
                    0
                };
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    class = class.as_str(),
                    delay_ms = delay.as_millis() as u64 + jitter_ms,
                    error = %e,
                    "transient failure, backing off"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay + Duration::from_millis(jitter_ms)) => {}
                    _ = shutdown.cancelled() => return Err(Error::Shutdown),
                }
                attempt += 1;
            }
        }
    }
}

/// Backoff schedule for one failure class. A quota answer means the provider
/// is telling us to slow down, so it waits longer than a dropped connection.
fn delay_for(policy: &RetryPolicy, class: ErrorClass, attempt: u32) -> Duration {
    match class {
        ErrorClass::Rpc => backoff_delay(
            attempt,
            policy.base * QUOTA_BACKOFF_FACTOR,
            policy.max * QUOTA_BACKOFF_FACTOR,
        ),
        _ => backoff_delay(attempt, policy.base, policy.max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let shutdown = CancellationToken::new();

        // Three 429s, success on the fourth call.
        let result = with_retries(&fast_policy(3), &shutdown, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(Error::Rpc {
                        method: "eth_getBlockByNumber".into(),
                        message: "429".into(),
                        retryable: true,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_validation() {
        let calls = AtomicU32::new(0);
        let shutdown = CancellationToken::new();

        let err = with_retries(&fast_policy(5), &shutdown, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Validation("bad hex".into())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts() {
        let shutdown = CancellationToken::new();
        let err = with_retries(&fast_policy(2), &shutdown, || async {
            Err::<(), _>(Error::Network("timeout".into()))
        })
        .await
        .unwrap_err();

        match err {
            Error::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, Error::Network(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn quota_errors_back_off_longer_than_network() {
        let policy = RetryPolicy::new(3);

        assert_eq!(
            delay_for(&policy, ErrorClass::Network, 0),
            Duration::from_millis(RETRY_BASE_DELAY_MS)
        );
        assert_eq!(
            delay_for(&policy, ErrorClass::Rpc, 0),
            Duration::from_millis(RETRY_BASE_DELAY_MS * QUOTA_BACKOFF_FACTOR as u64)
        );

        // Each schedule caps at its own ceiling.
        assert_eq!(
            delay_for(&policy, ErrorClass::Network, 20),
            Duration::from_millis(RETRY_MAX_DELAY_MS)
        );
        assert_eq!(
            delay_for(&policy, ErrorClass::Rpc, 20),
            Duration::from_millis(RETRY_MAX_DELAY_MS * QUOTA_BACKOFF_FACTOR as u64)
        );

        // Transient store failures follow the plain schedule.
        assert_eq!(
            delay_for(&policy, ErrorClass::Database, 1),
            delay_for(&policy, ErrorClass::Network, 1)
        );
    }

    #[tokio::test]
    async fn shutdown_stops_retries() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let err = with_retries(&fast_policy(5), &shutdown, || async {
            Ok::<_, Error>(1)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
