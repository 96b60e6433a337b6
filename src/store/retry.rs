//! Bounded retry with exponential backoff for gateway operations.
//!
//! Only transient errors are retried; domain and safety errors surface on the
//! first attempt. Jitter keeps concurrent retry storms from aligning.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{CoreError, CoreResult};

const BASE_DELAY_MS: u64 = 100;
const BACKOFF_FACTOR: u64 = 2;
const MAX_ATTEMPTS: u32 = 5;

/// Run `operation` up to five times with 100ms/200ms/400ms/800ms backoff plus
/// up to 50% jitter. The last error is surfaced when the budget is exhausted.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut operation: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut delay_ms = BASE_DELAY_MS;
    let mut last_error: Option<CoreError> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let jitter = rand::thread_rng().gen_range(0..=delay_ms / 2);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay_ms + jitter,
                    error = %e,
                    "Transient gateway error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = delay_ms.saturating_mul(BACKOFF_FACTOR);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| CoreError::transient(format!("{} retry budget exhausted", op_name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test_op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoreError::transient("connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn domain_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: CoreResult<()> = with_retry("test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::domain("bad input", "schema mismatch")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: CoreResult<()> = with_retry("test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::transient("still down")) }
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
