//! Endpoint health checking with trend analysis
//!
//! Each configured endpoint keeps consecutive-failure/success counters, its
//! last 100 probe results, and a derived state. State transitions go out on
//! the bus so the alerting engine can react without a direct dependency.

use crate::bus::{Signal, SignalPublisher};
use crate::config::{HealthConfig, HealthEndpointConfig};
use crate::resilience::{HttpClientPool, PoolClass};
use crate::time_provider::SharedTimeProvider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Probe history depth per endpoint
const HISTORY_DEPTH: usize = 100;

/// Derived endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl EndpointState {
    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointState::Healthy => "healthy",
            EndpointState::Degraded => "degraded",
            EndpointState::Unhealthy => "unhealthy",
            EndpointState::Unknown => "unknown",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            EndpointState::Healthy => 0,
            EndpointState::Unknown => 1,
            EndpointState::Degraded => 2,
            EndpointState::Unhealthy => 3,
        }
    }
}

/// Success-rate movement between history halves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// One recorded probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub healthy: bool,
    pub duration_ms: u64,
    pub code: Option<u16>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub state: EndpointState,
    pub critical: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub trend: Trend,
}

/// Aggregate system view
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: EndpointState,
    pub endpoints: Vec<EndpointStatus>,
}

#[derive(Debug, Default)]
struct EndpointTrack {
    state: EndpointState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    history: VecDeque<ProbeResult>,
}

/// Health checker over the configured endpoints
pub struct HealthChecker {
    config: HealthConfig,
    pool: Arc<HttpClientPool>,
    tracks: DashMap<String, EndpointTrack>,
    publisher: SignalPublisher,
    time: SharedTimeProvider,
}

impl HealthChecker {
    /// Creates a checker; endpoints start in `unknown`
    pub fn new(
        config: HealthConfig,
        pool: Arc<HttpClientPool>,
        publisher: SignalPublisher,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            config,
            pool,
            tracks: DashMap::new(),
            publisher,
            time,
        }
    }

    /// Probes every endpoint once and returns the aggregate view
    pub async fn check_all(&self, cancel: &CancellationToken) -> SystemHealth {
        for endpoint in &self.config.endpoints {
            let result = self.probe(endpoint, cancel).await;
            self.record(endpoint, result);
        }
        self.snapshot()
    }

    /// Probes one endpoint, honoring its per-endpoint retry budget
    async fn probe(&self, endpoint: &HealthEndpointConfig, cancel: &CancellationToken) -> ProbeResult {
        let started = self.time.instant();
        let mut last_error = None;
        let mut last_code = None;

        for attempt in 0..=endpoint.retries {
            if cancel.is_cancelled() {
                break;
            }
            let request = self.pool.get(PoolClass::Health, &endpoint.url, cancel);
            let outcome = tokio::time::timeout(Duration::from_millis(endpoint.timeout_ms), request)
                .await
                .unwrap_or_else(|_| {
                    Err(crate::error::CoreError::Timeout {
                        operation: endpoint.name.clone(),
                        timeout_ms: endpoint.timeout_ms,
                    })
                });
            match outcome {
                Ok(response) => {
                    last_code = Some(response.status);
                    if endpoint.expected_status.contains(&response.status) {
                        return ProbeResult {
                            healthy: true,
                            duration_ms: started.elapsed().as_millis() as u64,
                            code: Some(response.status),
                            error: None,
                            at: self.time.now_utc(),
                        };
                    }
                    last_error = Some(format!("unexpected status {}", response.status));
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                }
            }
            if attempt < endpoint.retries {
                self.time.sleep(Duration::from_millis(100)).await;
            }
        }

        ProbeResult {
            healthy: false,
            duration_ms: started.elapsed().as_millis() as u64,
            code: last_code,
            error: last_error,
            at: self.time.now_utc(),
        }
    }

    /// Records a probe and derives the endpoint's new state
    fn record(&self, endpoint: &HealthEndpointConfig, result: ProbeResult) {
        let mut track = self.tracks.entry(endpoint.name.clone()).or_default();
        let previous = track.state;

        if result.healthy {
            track.consecutive_successes += 1;
            track.consecutive_failures = 0;
        } else {
            track.consecutive_failures += 1;
            track.consecutive_successes = 0;
        }

        track.history.push_back(result);
        while track.history.len() > HISTORY_DEPTH {
            track.history.pop_front();
        }

        track.state = if track.consecutive_failures >= self.config.failure_threshold {
            EndpointState::Unhealthy
        } else if track.consecutive_failures > 0 {
            EndpointState::Degraded
        } else if track.consecutive_successes >= self.config.recovery_threshold {
            EndpointState::Healthy
        } else {
            EndpointState::Unknown
        };

        if track.state != previous {
            info!(
                endpoint = %endpoint.name,
                from = previous.as_str(),
                to = track.state.as_str(),
                "endpoint health transition"
            );
            self.publisher.publish(Signal::HealthTransition {
                endpoint: endpoint.name.clone(),
                from: previous.as_str().to_string(),
                to: track.state.as_str().to_string(),
                at: self.time.now_utc(),
            });
        } else {
            debug!(endpoint = %endpoint.name, state = track.state.as_str(), "probe recorded");
        }
    }

    /// Probes all endpoints on a fixed interval until cancelled
    pub async fn run_probe_loop(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.time.sleep(interval) => {
                    let _ = self.check_all(&shutdown.child_token()).await;
                }
            }
        }
        debug!("health probe loop stopped");
    }

    /// Current aggregate view without probing
    pub fn snapshot(&self) -> SystemHealth {
        let mut endpoints = Vec::new();
        for endpoint in &self.config.endpoints {
            let Some(track) = self.tracks.get(&endpoint.name) else {
                endpoints.push(EndpointStatus {
                    name: endpoint.name.clone(),
                    state: EndpointState::Unknown,
                    critical: endpoint.critical,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    success_rate: 0.0,
                    avg_response_ms: 0.0,
                    trend: Trend::Stable,
                });
                continue;
            };
            endpoints.push(endpoint_status(endpoint, &track));
        }

        SystemHealth {
            overall: derive_overall(&endpoints),
            endpoints,
        }
    }
}

fn endpoint_status(endpoint: &HealthEndpointConfig, track: &EndpointTrack) -> EndpointStatus {
    let total = track.history.len();
    let healthy = track.history.iter().filter(|r| r.healthy).count();
    let success_rate = if total == 0 {
        0.0
    } else {
        healthy as f64 / total as f64
    };
    let avg_response_ms = if total == 0 {
        0.0
    } else {
        track.history.iter().map(|r| r.duration_ms as f64).sum::<f64>() / total as f64
    };

    EndpointStatus {
        name: endpoint.name.clone(),
        state: track.state,
        critical: endpoint.critical,
        consecutive_failures: track.consecutive_failures,
        consecutive_successes: track.consecutive_successes,
        success_rate,
        avg_response_ms,
        trend: classify_trend(&track.history),
    }
}

/// Compares success rates between history halves
fn classify_trend(history: &VecDeque<ProbeResult>) -> Trend {
    if history.len() < 4 {
        return Trend::Stable;
    }
    let mid = history.len() / 2;
    let rate = |slice: &[&ProbeResult]| {
        slice.iter().filter(|r| r.healthy).count() as f64 / slice.len() as f64
    };
    let entries: Vec<&ProbeResult> = history.iter().collect();
    let older = rate(&entries[..mid]);
    let recent = rate(&entries[mid..]);

    if recent > older + 0.1 {
        Trend::Improving
    } else if recent + 0.1 < older {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

/// Critical endpoints dominate; otherwise half the fleet unhealthy still
/// only degrades the system
fn derive_overall(endpoints: &[EndpointStatus]) -> EndpointState {
    if endpoints.is_empty() {
        return EndpointState::Unknown;
    }
    if endpoints
        .iter()
        .any(|e| e.critical && e.state == EndpointState::Unhealthy)
    {
        return EndpointState::Unhealthy;
    }

    let unhealthy = endpoints
        .iter()
        .filter(|e| e.state == EndpointState::Unhealthy)
        .count();
    if unhealthy * 2 >= endpoints.len() && unhealthy > 0 {
        return EndpointState::Unhealthy;
    }
    if unhealthy > 0 {
        return EndpointState::Degraded;
    }

    endpoints
        .iter()
        .map(|e| e.state)
        .max_by_key(EndpointState::rank)
        .unwrap_or(EndpointState::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, state: EndpointState, critical: bool) -> EndpointStatus {
        EndpointStatus {
            name: name.to_string(),
            state,
            critical,
            consecutive_failures: 0,
            consecutive_successes: 0,
            success_rate: 1.0,
            avg_response_ms: 5.0,
            trend: Trend::Stable,
        }
    }

    #[test]
    fn critical_unhealthy_dominates() {
        let endpoints = vec![
            status("bridge", EndpointState::Unhealthy, true),
            status("tracker", EndpointState::Healthy, false),
        ];
        assert_eq!(derive_overall(&endpoints), EndpointState::Unhealthy);
    }

    #[test]
    fn single_noncritical_unhealthy_only_degrades() {
        let endpoints = vec![
            status("a", EndpointState::Unhealthy, false),
            status("b", EndpointState::Healthy, false),
            status("c", EndpointState::Healthy, false),
        ];
        assert_eq!(derive_overall(&endpoints), EndpointState::Degraded);
    }

    #[test]
    fn majority_unhealthy_is_unhealthy() {
        let endpoints = vec![
            status("a", EndpointState::Unhealthy, false),
            status("b", EndpointState::Unhealthy, false),
            status("c", EndpointState::Healthy, false),
        ];
        assert_eq!(derive_overall(&endpoints), EndpointState::Unhealthy);
    }

    #[test]
    fn all_healthy_is_healthy() {
        let endpoints = vec![
            status("a", EndpointState::Healthy, false),
            status("b", EndpointState::Healthy, true),
        ];
        assert_eq!(derive_overall(&endpoints), EndpointState::Healthy);
    }

    #[test]
    fn trend_detects_degradation() {
        let mut history = VecDeque::new();
        for i in 0..20 {
            history.push_back(ProbeResult {
                healthy: i < 10,
                duration_ms: 5,
                code: Some(200),
                error: None,
                at: Utc::now(),
            });
        }
        assert_eq!(classify_trend(&history), Trend::Degrading);
    }

    #[test]
    fn trend_detects_improvement() {
        let mut history = VecDeque::new();
        for i in 0..20 {
            history.push_back(ProbeResult {
                healthy: i >= 10,
                duration_ms: 5,
                code: Some(200),
                error: None,
                at: Utc::now(),
            });
        }
        assert_eq!(classify_trend(&history), Trend::Improving);
    }

    #[test]
    fn short_history_is_stable() {
        let history = VecDeque::new();
        assert_eq!(classify_trend(&history), Trend::Stable);
    }
}
