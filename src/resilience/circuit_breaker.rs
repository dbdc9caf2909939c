//! Circuit breaker protecting downstream dependencies
//!
//! CLOSED counts consecutive failures and opens at the threshold. OPEN
//! rejects immediately until the recovery timeout elapses, then admits
//! trial calls in HALF_OPEN; enough trial successes close the breaker,
//! any trial failure re-opens it and restarts the timer.

use crate::config::BreakerConfig;
use crate::error::{CoreError, Result};
use crate::time_provider::SharedTimeProvider;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Externally visible breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// One breaker instance, typically one per downstream class
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    time: SharedTimeProvider,
}

impl CircuitBreaker {
    /// Creates a closed breaker
    pub fn new(name: impl Into<String>, config: BreakerConfig, time: SharedTimeProvider) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            time,
        }
    }

    /// Admits or rejects a call; OPEN transitions to HALF_OPEN once the
    /// recovery timeout has elapsed
    pub fn check(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| self.time.instant().duration_since(at))
                    .unwrap_or_default();
                let recovery = Duration::from_millis(self.config.recovery_timeout_ms);
                if elapsed >= recovery {
                    info!(breaker = %self.name, "recovery timeout elapsed, admitting trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    let retry_after_s = recovery
                        .saturating_sub(elapsed)
                        .as_secs()
                        .max(1);
                    Err(CoreError::CircuitOpen {
                        class: self.name.clone(),
                        retry_after_s,
                    })
                }
            }
        }
    }

    /// Records a successful call
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold.as_u32() {
                    info!(breaker = %self.name, "trial calls succeeded, closing");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold.as_u32() {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(self.time.instant());
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "trial call failed, re-opening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.time.instant());
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Runs `operation` behind the breaker, recording the outcome
    pub async fn call<T, Fut>(&self, operation: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.check()?;
        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                // terminal caller errors say nothing about downstream health
                if err.is_retryable() {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{FailureThreshold, SuccessThreshold};
    use crate::time_provider::test_time_provider;

    fn breaker(failure_threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "health",
            BreakerConfig {
                failure_threshold: FailureThreshold::try_new(failure_threshold).unwrap(),
                success_threshold: SuccessThreshold::try_new(2).unwrap(),
                recovery_timeout_ms: recovery_ms,
            },
            test_time_provider(),
        )
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = breaker(3, 60_000);
        for _ in 0..2 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.check(),
            Err(CoreError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = breaker(3, 60_000);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_rejects_until_recovery_then_half_opens() {
        let breaker = breaker(1, 50);
        breaker.record_failure();
        assert!(breaker.check().is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_closes_after_enough_successes() {
        let breaker = breaker(1, 10);
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.check().unwrap();

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_restarts_timer() {
        let breaker = breaker(1, 40);
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(60)).await;
        breaker.check().unwrap();

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.check().is_err());
    }

    #[tokio::test]
    async fn call_records_outcomes() {
        let breaker = breaker(1, 60_000);
        let err: Result<()> = breaker
            .call(async {
                Err(CoreError::Network {
                    operation: "probe".into(),
                    detail: "down".into(),
                })
            })
            .await;
        assert!(err.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
