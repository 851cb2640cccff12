//! Bounded retry for output writes.
//!
//! Every write to the output store goes through [`with_retry`]. A failed
//! attempt is logged and retried after an exponentially growing delay; once
//! the policy's attempts are used up the last error is returned together
//! with the number of attempts made, and the caller decides whether the run
//! can continue without that batch.

use std::fmt::Display;
use std::future::Future;

use crate::config::RetryPolicy;

/// The final error of an operation that failed every attempt.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Attempts made, the first one included.
    pub attempts: u32,
    /// Error returned by the last attempt.
    pub error: E,
}

/// Runs `operation` until it succeeds or `policy.max_attempts` is reached.
///
/// `label` names the batch in log lines.
///
/// # Errors
///
/// Returns [`RetryExhausted`] with the last error if no attempt succeeded.
pub async fn with_retry<T, E, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= max_attempts => {
                log::error!("{label}: giving up after {attempt} attempt(s): {error}");
                return Err(RetryExhausted {
                    attempts: attempt,
                    error,
                });
            }
            Err(error) => {
                let delay = policy.delay_after(attempt);
                log::warn!("{label}: attempt {attempt}/{max_attempts} failed: {error}");
                log::warn!("  retrying in {delay:?}...");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry("batch", &RetryPolicy::immediate(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("fail {n}")) } else { Ok(n) }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("batch", &RetryPolicy::immediate(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("store unavailable")
        })
        .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.error, "store unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_attempt_policy_does_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("batch", &RetryPolicy::immediate(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope")
        })
        .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
