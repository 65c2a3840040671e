use crate::config::UploadConfig;
use crate::error::{AppError, Result};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(upload: &UploadConfig) -> Self {
        Self {
            max_retries: upload.max_retries,
            base_delay: Duration::from_millis(upload.retry_base_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base...
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Retry a future with exponential backoff
///
/// Only transient transport failures are retried, and never more than
/// `policy.max_retries` times, so one call is bounded in time.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                retries += 1;

                if retries > policy.max_retries {
                    return Err(e);
                }

                // Check if error is transient (retryable)
                let should_retry = match &e {
                    AppError::Http(reqwest_err) => {
                        // Retry on connection errors, timeouts, server errors (5xx)
                        reqwest_err.is_timeout()
                            || reqwest_err.is_connect()
                            || reqwest_err
                                .status()
                                .map(|s| s.is_server_error())
                                .unwrap_or(false)
                    }
                    AppError::Io(_) | AppError::Mqtt(_) => true,
                    _ => false,
                };

                if !should_retry {
                    return Err(e);
                }

                let delay = policy.delay_for(retries);
                warn!(
                    "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                    retries, policy.max_retries, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_delay_doubles() {
        let p = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_io_errors_retried_until_limit() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_with_backoff(&policy(2), || {
            calls.set(calls.get() + 1);
            async { Err(AppError::Io(std::io::Error::other("reset"))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 3, "one attempt plus two retries");
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_with_backoff(&policy(5), || {
            calls.set(calls.get() + 1);
            async { Err(AppError::InvalidData("bad".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(AppError::InvalidData(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = Cell::new(0);
        let result = retry_with_backoff(&policy(2), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 2 {
                    Err(AppError::Io(std::io::Error::other("timeout")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }
}
