//! Retry with exponential backoff for transient store errors.
//!
//! SQLite reports contention as SQLITE_BUSY (5) and SQLITE_LOCKED (6), and
//! under heavy WAL write load occasionally as SQLITE_IOERR (10 and extended
//! codes). These resolve after a short pause and are retried; everything else
//! is returned to the caller immediately.

use std::{fmt::Debug, future::Future, time::Duration};

use sqlx::Error as SqlxError;

/// Errors that know whether repeating the operation can succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for SqlxError {
    fn is_retryable(&self) -> bool {
        is_retryable_error(self)
    }
}

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (caps the exponential growth).
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0) to add randomness to delays.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            jitter_factor: 0.2,
        }
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped, plus jitter.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let capped_delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);

        // Add jitter to prevent thundering herd
        let jitter = if self.jitter_factor > 0.0 {
            let jitter_range = (capped_delay as f64 * self.jitter_factor) as u64;
            if jitter_range > 0 {
                // Simple pseudo-random jitter using current time
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .subsec_nanos() as u64;
                now % jitter_range
            } else {
                0
            }
        } else {
            0
        };

        Duration::from_millis(capped_delay + jitter)
    }
}

/// Check if an error is a transient SQLite error that should be retried.
///
/// SQLite error codes considered retryable:
/// - 5 = SQLITE_BUSY (database is locked by another connection)
/// - 6 = SQLITE_LOCKED (table is locked within a transaction)
/// - 10 = SQLITE_IOERR (disk I/O error - base code)
/// - Other codes with low byte 10 = SQLITE_IOERR extended codes
pub fn is_retryable_error(e: &SqlxError) -> bool {
    if let SqlxError::Database(db_err) = e
        && let Some(code) = db_err.code()
    {
        let code_str = code.as_ref();
        if matches!(code_str, "5" | "6" | "10") {
            return true;
        }
        if let Ok(code_num) = code_str.parse::<u32>() {
            return code_num > 10 && (code_num & 0xFF) == 10;
        }
    }
    false
}

/// Run `f`, retrying errors for which [`Retryable::is_retryable`] holds.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Debug,
{
    with_retry_if(config, operation_name, |e: &E| e.is_retryable(), f).await
}

/// Run `f`, retrying errors accepted by `should_retry` up to
/// `config.max_retries` times. The last error is returned once the budget is
/// spent.
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Debug,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if attempt < config.max_retries && should_retry(&e) => {
                let delay = config.calculate_delay(attempt);

                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = ?e,
                    "Operation failed, retrying with backoff"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = ?e,
                        "Operation failed after all retries"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Flaky(bool);

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 500);
        assert_eq!(config.max_delay_ms, 10_000);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.0, // No jitter for predictable testing
        };

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(5), Duration::from_millis(3200));
        assert_eq!(config.calculate_delay(6), Duration::from_millis(5000)); // Capped
        assert_eq!(config.calculate_delay(80), Duration::from_millis(5000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.2,
        };

        let delay = config.calculate_delay(0);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(120));
    }

    #[test]
    fn test_non_database_errors_are_not_retryable() {
        assert!(!is_retryable_error(&SqlxError::RowNotFound));
        assert!(!is_retryable_error(&SqlxError::PoolTimedOut));
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(3), "flaky", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Flaky(true))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Flaky> = with_retry(&fast(2), "always_fails", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(true))
        })
        .await;

        assert_eq!(result, Err(Flaky(true)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Flaky> = with_retry(&fast(5), "permanent", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(false))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_if_uses_predicate() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Flaky> =
            with_retry_if(&fast(2), "any_error", |_| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
