//! Bounded access to the backing stores.
//!
//! Every store call on the hot path runs under a timeout. A transient failure
//! is retried once after a short backoff; anything else, or a second failure,
//! surfaces as [`AuthError::VerificationUnavailable`] so callers fail closed.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePolicy {
    timeout: Duration,
    retry_backoff: Duration,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_millis(50))
    }
}

impl StorePolicy {
    #[must_use]
    pub const fn new(timeout: Duration, retry_backoff: Duration) -> Self {
        Self {
            timeout,
            retry_backoff,
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }
}

/// Whether a store error is worth one more attempt.
fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<sqlx::Error>().is_some_and(|db| {
            matches!(
                db,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
            )
        }) || cause.downcast_ref::<std::io::Error>().is_some()
    })
}

/// Run `call` under `policy`.
///
/// # Errors
///
/// Returns [`AuthError::VerificationUnavailable`] when the call times out or
/// fails twice, or fails with a non-transient error.
pub async fn bounded<T, F, Fut>(
    policy: &StorePolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, AuthError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let reason = match timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                let retry = is_transient(&err);
                warn!(operation, attempt, error = %err, "store call failed");
                if !retry {
                    return Err(AuthError::VerificationUnavailable(format!(
                        "{operation}: {err}"
                    )));
                }
                err.to_string()
            }
            Err(_) => {
                warn!(operation, attempt, timeout_ms = policy.timeout.as_millis(), "store call timed out");
                "timed out".to_string()
            }
        };

        if attempt >= 2 {
            return Err(AuthError::VerificationUnavailable(format!(
                "{operation}: {reason}"
            )));
        }
        sleep(policy.retry_backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> StorePolicy {
        StorePolicy::new(Duration::from_millis(50), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_a_timeout_once() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = bounded(&fast(), "test.op", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    sleep(Duration::from_millis(200)).await;
                }
                Ok(7)
            }
        })
        .await?;

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn gives_up_after_second_timeout() {
        let result: Result<(), AuthError> = bounded(&fast(), "test.op", || async {
            sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(AuthError::VerificationUnavailable(_))));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), AuthError> = bounded(&fast(), "test.op", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("constraint violated"))
            }
        })
        .await;

        assert!(matches!(result, Err(AuthError::VerificationUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
