//! Retry policy: bounded attempts with a fixed backoff.
//!
//! Retrying is opt-in. Only operations explicitly wrapped in
//! [retry_with_backoff] are retried; everything else fails on first error.

use std::future::Future;
use std::time::Duration;

use crate::error::FlockError;

/// Decision after a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Fail,
}

/// Fixed-backoff retry policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// `failures` is the 0-based count of failed attempts so far.
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures >= self.max_retries {
            RetryDecision::Fail
        } else {
            RetryDecision::RetryAfter(self.backoff)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

/// Run `op` until it succeeds or the policy gives up.
///
/// `op` receives the 0-based attempt number. `on_retry` is called with the
/// attempt number and error before every backoff sleep, so callers can
/// report the retry. The last error is returned when the policy fails.
pub async fn retry_with_backoff<T, F, Fut, R>(
    policy: &RetryPolicy,
    mut op: F,
    mut on_retry: R,
) -> Result<T, FlockError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FlockError>>,
    R: FnMut(u32, &FlockError),
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match policy.decide(attempt) {
                RetryDecision::Fail => return Err(err),
                RetryDecision::RetryAfter(delay) => {
                    on_retry(attempt, &err);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn decide_fails_after_max_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5));
        assert_eq!(
            policy.decide(0),
            RetryDecision::RetryAfter(Duration::from_millis(5))
        );
        assert_eq!(
            policy.decide(1),
            RetryDecision::RetryAfter(Duration::from_millis(5))
        );
        assert_eq!(policy.decide(2), RetryDecision::Fail);
        assert_eq!(RetryPolicy::none().decide(0), RetryDecision::Fail);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let value = retry_with_backoff(
            &policy,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(FlockError::Task(format!("attempt {attempt}")))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |attempt, _| retries.push(attempt),
        )
        .await
        .expect("third attempt succeeds");

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![0, 1]);
    }

    #[tokio::test]
    async fn gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let err = retry_with_backoff(
            &policy,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(FlockError::Task(format!("attempt {attempt}"))) }
            },
            |_, _| {},
        )
        .await
        .expect_err("always failing op gives up");

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.to_string(), "task error: attempt 3");
    }
}
