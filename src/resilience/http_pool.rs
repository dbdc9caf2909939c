//! HTTP connection pool with per-purpose clients
//!
//! Each purpose class keeps its own keep-alive `reqwest` client with a
//! class-specific timeout, its own circuit breaker, and its own counters.
//! Requests route through the retry executor so transient transport
//! failures back off instead of surfacing immediately.

use crate::config::{BreakerConfig, RetryConfig};
use crate::error::{CoreError, Result};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::resilience::retry::RetryExecutor;
use crate::time_provider::SharedTimeProvider;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Purpose classes with their request timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolClass {
    Health,
    Status,
    Polling,
    Default,
}

impl PoolClass {
    /// All classes, used to pre-build clients
    pub const ALL: [PoolClass; 4] = [
        PoolClass::Health,
        PoolClass::Status,
        PoolClass::Polling,
        PoolClass::Default,
    ];

    /// Request timeout for this class
    pub fn timeout(&self) -> Duration {
        match self {
            PoolClass::Health => Duration::from_secs(2),
            PoolClass::Status => Duration::from_secs(3),
            PoolClass::Polling => Duration::from_secs(10),
            PoolClass::Default => Duration::from_secs(30),
        }
    }

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolClass::Health => "health",
            PoolClass::Status => "status",
            PoolClass::Polling => "polling",
            PoolClass::Default => "default",
        }
    }
}

/// Completed HTTP exchange
#[derive(Debug, Clone)]
pub struct PooledResponse {
    pub status: u16,
    pub body: String,
    pub duration: Duration,
}

impl PooledResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Default)]
struct ClassCounters {
    inflight: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
}

/// Counter snapshot for one class
#[derive(Debug, Clone, Serialize)]
pub struct ClassStats {
    pub inflight: u64,
    pub completed: u64,
    pub errors: u64,
    pub breaker: CircuitState,
}

struct ClassEntry {
    client: reqwest::Client,
    breaker: CircuitBreaker,
    counters: ClassCounters,
}

/// Pool of purpose-specific HTTP clients
pub struct HttpClientPool {
    classes: HashMap<PoolClass, ClassEntry>,
    retry: RetryExecutor,
    time: SharedTimeProvider,
}

impl HttpClientPool {
    /// Builds one keep-alive client and breaker per purpose class
    pub fn new(
        retry_config: RetryConfig,
        breaker_config: BreakerConfig,
        time: SharedTimeProvider,
    ) -> Result<Self> {
        let mut classes = HashMap::new();
        for class in PoolClass::ALL {
            let client = reqwest::Client::builder()
                .timeout(class.timeout())
                .pool_idle_timeout(Duration::from_secs(90))
                .pool_max_idle_per_host(4)
                .user_agent(concat!("telebridge/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|err| CoreError::Internal {
                    message: format!("failed to build {} http client: {err}", class.as_str()),
                })?;
            classes.insert(
                class,
                ClassEntry {
                    client,
                    breaker: CircuitBreaker::new(
                        class.as_str(),
                        breaker_config.clone(),
                        time.clone(),
                    ),
                    counters: ClassCounters::default(),
                },
            );
        }
        Ok(Self {
            classes,
            retry: RetryExecutor::new(retry_config, time.clone()),
            time,
        })
    }

    /// GETs `url` through the class client, behind its breaker and the
    /// retry executor
    pub async fn get(
        &self,
        class: PoolClass,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<PooledResponse> {
        let entry = self.entry(class)?;
        entry.breaker.check()?;
        entry.counters.inflight.fetch_add(1, Ordering::SeqCst);

        let result = self
            .retry
            .execute(class.as_str(), cancel, |attempt| {
                let client = entry.client.clone();
                let url = url.to_string();
                let time = self.time.clone();
                async move {
                    debug!(class = class.as_str(), %url, attempt, "http get");
                    let started = time.instant();
                    let response = client.get(&url).send().await?;
                    let status = response.status().as_u16();
                    let body = response.text().await?;
                    if (500..600).contains(&status) {
                        return Err(CoreError::Network {
                            operation: url.clone(),
                            detail: format!("server error {status}"),
                        });
                    }
                    Ok(PooledResponse {
                        status,
                        body,
                        duration: started.elapsed(),
                    })
                }
            })
            .await;

        entry.counters.inflight.fetch_sub(1, Ordering::SeqCst);
        match &result {
            Ok(_) => {
                entry.counters.completed.fetch_add(1, Ordering::SeqCst);
                entry.breaker.record_success();
            }
            Err(err) => {
                entry.counters.errors.fetch_add(1, Ordering::SeqCst);
                if err.is_retryable() {
                    entry.breaker.record_failure();
                }
            }
        }
        result
    }

    /// Breaker state for one class
    pub fn breaker_state(&self, class: PoolClass) -> CircuitState {
        self.classes
            .get(&class)
            .map(|e| e.breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Manually records a class-level outcome, for probes that bypass `get`
    pub fn record_outcome(&self, class: PoolClass, success: bool) {
        if let Some(entry) = self.classes.get(&class) {
            if success {
                entry.breaker.record_success();
            } else {
                entry.breaker.record_failure();
            }
        }
    }

    /// Counter snapshot per class
    pub fn stats(&self) -> HashMap<&'static str, ClassStats> {
        self.classes
            .iter()
            .map(|(class, entry)| {
                (
                    class.as_str(),
                    ClassStats {
                        inflight: entry.counters.inflight.load(Ordering::SeqCst),
                        completed: entry.counters.completed.load(Ordering::SeqCst),
                        errors: entry.counters.errors.load(Ordering::SeqCst),
                        breaker: entry.breaker.state(),
                    },
                )
            })
            .collect()
    }

    fn entry(&self, class: PoolClass) -> Result<&ClassEntry> {
        self.classes.get(&class).ok_or_else(|| CoreError::Internal {
            message: format!("http pool missing class {}", class.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;

    fn pool() -> HttpClientPool {
        HttpClientPool::new(
            RetryConfig {
                base_delay_ms: 1,
                max_delay_ms: 5,
                ..RetryConfig::default()
            },
            BreakerConfig::default(),
            test_time_provider(),
        )
        .unwrap()
    }

    #[test]
    fn every_class_has_a_client_and_closed_breaker() {
        let pool = pool();
        let stats = pool.stats();
        assert_eq!(stats.len(), 4);
        for class in PoolClass::ALL {
            assert_eq!(pool.breaker_state(class), CircuitState::Closed);
        }
    }

    #[test]
    fn class_timeouts_are_ordered() {
        assert!(PoolClass::Health.timeout() < PoolClass::Status.timeout());
        assert!(PoolClass::Status.timeout() < PoolClass::Polling.timeout());
        assert!(PoolClass::Polling.timeout() < PoolClass::Default.timeout());
    }

    #[tokio::test]
    async fn connection_refused_counts_as_error_and_trips_breaker() {
        let pool = pool();
        let cancel = CancellationToken::new();
        // nothing listens on this port
        for _ in 0..5 {
            let result = pool
                .get(PoolClass::Health, "http://127.0.0.1:1/health", &cancel)
                .await;
            assert!(result.is_err());
        }
        let stats = pool.stats();
        assert!(stats["health"].errors >= 5);
        assert_eq!(pool.breaker_state(PoolClass::Health), CircuitState::Open);
    }
}
