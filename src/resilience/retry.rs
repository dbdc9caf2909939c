//! Retry executor with exponential backoff and jitter
//!
//! Only errors whose kind is retryable are re-attempted; terminal kinds
//! (validation, authentication, rate-limit, security) surface immediately.
//! Backoff sleeps race the caller's cancellation token, so a deadline
//! expiring mid-schedule aborts promptly instead of finishing the ladder.

use crate::config::RetryConfig;
use crate::error::{CoreError, Result};
use crate::time_provider::SharedTimeProvider;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Jitter applied around each computed delay
const JITTER_FRACTION: f64 = 0.25;

/// Executes fallible async operations under a retry policy
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    time: SharedTimeProvider,
}

impl RetryExecutor {
    /// Creates an executor with the given policy
    pub fn new(config: RetryConfig, time: SharedTimeProvider) -> Self {
        Self { config, time }
    }

    /// Runs `operation` up to `max_attempts` times
    ///
    /// The closure receives the 1-based attempt number. Cancellation wins
    /// over any pending backoff sleep and surfaces as a timeout.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.as_u32();
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(operation_name));
            }
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(cancelled(operation_name)),
                        () = self.time.sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Backoff delay for a 1-based attempt: `base * 2^(attempt-1)`, with
    /// ±25% jitter, capped at the configured maximum
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered = (raw as f64 * (1.0 + jitter)).max(0.0) as u64;
        Duration::from_millis(jittered.min(self.config.max_delay_ms))
    }
}

fn cancelled(operation_name: &str) -> CoreError {
    CoreError::Timeout {
        operation: operation_name.to_string(),
        timeout_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::MaxAttempts;
    use crate::time_provider::test_time_provider;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig {
                max_attempts: MaxAttempts::try_new(max_attempts).unwrap(),
                base_delay_ms: 100,
                max_delay_ms: 1000,
            },
            test_time_provider(),
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = executor(3)
            .execute("probe", &CancellationToken::new(), move |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(CoreError::Network {
                            operation: "probe".into(),
                            detail: "connection refused".into(),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<()> = executor(3)
            .execute("dispatch", &CancellationToken::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(CoreError::Validation {
                        field: "type".into(),
                        reason: "bad".into(),
                        constraint: "enum".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_cap_is_honored() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<()> = executor(3)
            .execute("probe", &CancellationToken::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(CoreError::Network {
                        operation: "probe".into(),
                        detail: "down".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_aborts_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<()> = executor(3)
            .execute("probe", &cancel, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let executor = executor(5);
        for attempt in 1..=3u32 {
            let expected = 100u64 * (1 << (attempt - 1));
            let low = (expected as f64 * 0.75) as u64;
            let high = (expected as f64 * 1.25) as u64;
            for _ in 0..50 {
                let delay = executor.delay_for(attempt).as_millis() as u64;
                assert!(
                    (low..=high).contains(&delay),
                    "attempt {attempt}: {delay}ms outside [{low}, {high}]"
                );
            }
        }
    }

    #[test]
    fn delay_is_capped_at_max() {
        let executor = executor(10);
        for _ in 0..50 {
            assert!(executor.delay_for(10).as_millis() as u64 <= 1000);
        }
    }
}
