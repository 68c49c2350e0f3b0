//! Bounded retry for transient collaborator failures.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::{Error, Result};

/// Fixed-delay retry with an attempt budget and an overall deadline.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub delay: Duration,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(5),
            deadline: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// No waiting between attempts; for tests and dry runs.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            delay: Duration::ZERO,
            deadline: Duration::from_secs(5),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error,
/// runs out of attempts or passes the deadline.
pub async fn retry_transient<F, Fut, T>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let run = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        delay_ms = policy.delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(policy.delay).await;
                }
                Err(e) => {
                    error!(operation = %operation_name, attempt, error = %e, "giving up");
                    return Err(e);
                }
            }
        }
    };

    match tokio::time::timeout(policy.deadline, run).await {
        Ok(result) => result,
        Err(_) => {
            error!(operation = %operation_name, deadline_ms = policy.deadline.as_millis() as u64, "deadline exceeded");
            Err(Error::Deadline {
                operation: operation_name.to_string(),
                after: policy.deadline,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable() -> Error {
        Error::Backend(BackendError::Api {
            status: 503,
            message: "busy".into(),
        })
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            delay: Duration::from_millis(1),
            deadline: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert_eq!(policy.deadline, Duration::from_secs(20));
        assert_eq!(policy.with_max_attempts(4).max_attempts, 4);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let count = AtomicU32::new(0);
        let result = retry_transient(&policy(3), "op", || {
            let n = count.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(unavailable())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stops_after_max_attempts() {
        let count = AtomicU32::new(0);
        let result: Result<()> = retry_transient(&policy(2), "op", || {
            count.fetch_add(1, Ordering::SeqCst);
            async { Err(unavailable()) }
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let count = AtomicU32::new(0);
        let result: Result<()> = retry_transient(&policy(5), "op", || {
            count.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Config("bad".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_bounds_the_whole_run() {
        let policy = RetryPolicy {
            max_attempts: 100,
            delay: Duration::from_millis(20),
            deadline: Duration::from_millis(50),
        };
        let result: Result<()> = retry_transient(&policy, "op", || async { Err(unavailable()) }).await;
        assert!(matches!(result, Err(Error::Deadline { .. })));
    }
}
