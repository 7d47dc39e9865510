//! Retryable fetch with exponential backoff
//!
//! One policy object shared by every collaborator that talks to the
//! indexer, instead of ad-hoc loops at each call site.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::{PayoutError, Result};

/// Retry policy for idempotent HTTP reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Whether an error is worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// 408, 429 and 5xx are transient; every other status is final.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl Retryable for PayoutError {
    fn is_retryable(&self) -> bool {
        match self {
            PayoutError::HttpStatus { status, .. }
            | PayoutError::BroadcastRejected { status, .. } => is_retryable_status(*status),
            PayoutError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            PayoutError::NetworkTimeout(_) => true,
            _ => false,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && e.is_retryable() => {
                let delay = policy.backoff(attempt - 1);
                tracing::warn!(
                    "🔁 {} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    attempt,
                    attempts,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn status_error(status: u16) -> PayoutError {
        PayoutError::HttpStatus {
            url: "https://indexer.invalid/tx".to_string(),
            status,
            body: String::new(),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(10), Duration::from_millis(5_000));
        assert_eq!(policy.backoff(64), Duration::from_millis(5_000));
    }

    #[test]
    fn test_status_classification() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(502));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
        assert!(!PayoutError::InvalidMnemonic("bad".into()).is_retryable());
        assert!(!PayoutError::BroadcastRejected {
            status: 400,
            message: "min relay fee not met".into()
        }
        .is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry(&RetryPolicy::default(), "fetch", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(status_error(503))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry(&RetryPolicy::default(), "fetch", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(status_error(429))
        })
        .await;
        assert!(matches!(result, Err(PayoutError::HttpStatus { status: 429, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry(&RetryPolicy::default(), "fetch", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(status_error(400))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
