//! Bounded retries for backing store calls.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::StoreError;

/// Exponential backoff with jitter, retried only on transient errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// A call that kept failing.
#[derive(Debug)]
pub struct Exhausted {
    /// The last error returned.
    pub error: StoreError,
    /// Total attempts made, including the first.
    pub attempts: usize,
}

/// Run `call` until it succeeds, fails permanently, or `policy` runs out.
///
/// `operation` only labels log lines.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    call: F,
) -> Result<T, Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = AtomicUsize::new(0);
    let mut call = call;
    let counted = || {
        attempts.fetch_add(1, Ordering::SeqCst);
        call()
    };

    counted
        .retry(policy.backoff())
        .when(StoreError::is_transient)
        .notify(|err: &StoreError, delay: Duration| {
            log::warn!("{} failed ({}); retrying in {:?}", operation, err, delay);
        })
        .await
        .map_err(|error| Exhausted {
            error,
            attempts: attempts.load(Ordering::SeqCst),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Http {
            operation: "upsert".to_string(),
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let result = retry(&fast(3), "upsert", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(unavailable())
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let exhausted = retry(&fast(2), "upsert", || async { Err::<(), _>(unavailable()) })
            .await
            .unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert!(exhausted.error.is_transient());
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let exhausted = retry(&fast(5), "create", || async {
            Err::<(), _>(StoreError::CollectionNotFound {
                collection: "docs".to_string(),
            })
        })
        .await
        .unwrap_err();
        assert_eq!(exhausted.attempts, 1);
    }
}
