//! Bridge lifecycle management
//!
//! The manager owns the external delivery process: cached liveness probes,
//! a strictly single-flight ready gate, start-with-retry, and polite/forced
//! shutdown. Concurrent `ensure_ready` callers collapse onto one in-flight
//! start and share its outcome; the status cache is only written under the
//! gate or by an explicit probe.

use crate::bridge::{BridgeStatus, CachedRunning};
use crate::config::BridgeEnv;
use crate::error::{CoreError, Result};
use crate::resilience::{HttpClientPool, PoolClass};
use crate::time_provider::SharedTimeProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process;

/// Liveness cache TTL
const CACHE_TTL_MS: u64 = 30_000;

/// Ready-gate polling backoff, capped at the last entry
const READY_BACKOFF_MS: [u64; 6] = [100, 200, 500, 1000, 2000, 4000];

/// Scheduled-wait budget for `wait_for_ready`
const READY_BUDGET_MS: u64 = 10_000;

/// How long a waiter follows someone else's in-flight start
const WAITER_BUDGET_MS: u64 = 5_000;

/// Waiter polling interval
const WAITER_POLL_MS: u64 = 100;

/// Start attempts before giving up
const START_ATTEMPTS: u32 = 3;

/// Outcome of an `ensure_ready` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The bridge was already up (or another caller just brought it up)
    AlreadyRunning,
    /// This caller performed the start
    Started,
}

impl EnsureOutcome {
    /// Name used in the `ensure_bridge_running` tool result
    pub fn as_str(&self) -> &'static str {
        match self {
            EnsureOutcome::AlreadyRunning => "already_running",
            EnsureOutcome::Started => "started",
        }
    }
}

/// Manages the external delivery bridge process
pub struct BridgeManager {
    executable: String,
    base_url: String,
    dotenv_candidates: Vec<PathBuf>,
    pool: Arc<HttpClientPool>,
    time: SharedTimeProvider,
    cache: Mutex<Option<CachedRunning>>,
    start_in_flight: AtomicBool,
    last_start_outcome: Mutex<Option<std::result::Result<(), String>>>,
    /// Total `start()` invocations, for single-flight verification
    start_attempts: AtomicU64,
}

impl BridgeManager {
    /// Creates a manager for the given executable and health base URL
    pub fn new(
        executable: &str,
        base_url: &str,
        dotenv_candidates: Vec<PathBuf>,
        pool: Arc<HttpClientPool>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            executable: executable.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            dotenv_candidates,
            pool,
            time,
            cache: Mutex::new(None),
            start_in_flight: AtomicBool::new(false),
            last_start_outcome: Mutex::new(None),
            start_attempts: AtomicU64::new(0),
        }
    }

    /// Health endpoint URL
    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    /// Metrics endpoint URL
    pub fn metrics_url(&self) -> String {
        format!("{}/metrics", self.base_url)
    }

    /// Total `start()` invocations since construction
    pub fn start_attempt_count(&self) -> u64 {
        self.start_attempts.load(Ordering::SeqCst)
    }

    /// Cached liveness, probing only when the cache is stale
    pub async fn is_running_cached(&self, cancel: &CancellationToken) -> bool {
        let now_ms = self.time.epoch_millis();
        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.as_ref() {
                if now_ms.saturating_sub(cached.cached_at_ms) <= CACHE_TTL_MS {
                    return cached.running;
                }
            }
        }
        self.probe(cancel).await
    }

    /// Probes the health endpoint; on failure falls back to a process scan
    pub async fn probe(&self, cancel: &CancellationToken) -> bool {
        let running = match self
            .pool
            .get(PoolClass::Status, &self.health_url(), cancel)
            .await
        {
            Ok(response) => response.is_success(),
            Err(err) => {
                debug!(%err, "health probe failed, falling back to process scan");
                !process::find_pids_by_name(&self.executable).is_empty()
            }
        };
        self.set_cache(running);
        running
    }

    /// Drops the liveness cache; the next check probes
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    fn set_cache(&self, running: bool) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CachedRunning {
                running,
                cached_at_ms: self.time.epoch_millis(),
            });
        }
    }

    /// The ready gate: returns once the bridge answers its health endpoint
    ///
    /// Strictly single-flight. A caller that loses the race waits for the
    /// winner (bounded) and inherits its outcome; the winner runs the
    /// start-with-retry schedule.
    pub async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<EnsureOutcome> {
        if self.is_running_cached(cancel).await {
            return Ok(EnsureOutcome::AlreadyRunning);
        }

        if self
            .start_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // we own the start
            if let Ok(mut outcome) = self.last_start_outcome.lock() {
                *outcome = None;
            }
            self.clear_cache();
            let result = self.start_with_retry(cancel).await;
            if let Ok(mut outcome) = self.last_start_outcome.lock() {
                *outcome = Some(result.as_ref().map(|_| ()).map_err(ToString::to_string));
            }
            self.start_in_flight.store(false, Ordering::SeqCst);
            result.map(|()| EnsureOutcome::Started)
        } else {
            self.wait_for_other_start(cancel).await
        }
    }

    /// Follows another caller's in-flight start and inherits its outcome
    async fn wait_for_other_start(&self, cancel: &CancellationToken) -> Result<EnsureOutcome> {
        let mut waited_ms = 0u64;
        while self.start_in_flight.load(Ordering::SeqCst) {
            if waited_ms >= WAITER_BUDGET_MS {
                return Err(CoreError::BridgeStartFailed {
                    attempts: 0,
                    reason: "timed out waiting for a concurrent start".to_string(),
                });
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(CoreError::Timeout {
                        operation: "ensure_ready".to_string(),
                        timeout_ms: waited_ms,
                    });
                }
                () = self.time.sleep(Duration::from_millis(WAITER_POLL_MS)) => {
                    waited_ms += WAITER_POLL_MS;
                }
            }
        }

        let inherited = self
            .last_start_outcome
            .lock()
            .ok()
            .and_then(|outcome| outcome.clone());
        match inherited {
            Some(Ok(())) => Ok(EnsureOutcome::AlreadyRunning),
            Some(Err(reason)) => Err(CoreError::BridgeStartFailed {
                attempts: START_ATTEMPTS,
                reason,
            }),
            // the gate cleared without recording: fall back to a probe
            None => {
                if self.probe(cancel).await {
                    Ok(EnsureOutcome::AlreadyRunning)
                } else {
                    Err(CoreError::BridgeStartFailed {
                        attempts: 0,
                        reason: "concurrent start finished without an outcome".to_string(),
                    })
                }
            }
        }
    }

    /// Start-with-retry schedule: up to three attempts, 2s/4s/8s between
    async fn start_with_retry(&self, cancel: &CancellationToken) -> Result<()> {
        let mut last_reason = String::new();
        for attempt in 1..=START_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(CoreError::Timeout {
                    operation: "start_bridge".to_string(),
                    timeout_ms: 0,
                });
            }
            match self.start().await {
                Ok(pid) => match self.wait_for_ready(cancel).await {
                    Ok(()) => {
                        info!(pid, attempt, "bridge started and ready");
                        self.set_cache(true);
                        return Ok(());
                    }
                    Err(err) => {
                        last_reason = format!("attempt {attempt}: not ready: {err}");
                        warn!(attempt, %err, "bridge spawned but never became ready");
                    }
                },
                // configuration problems cannot be retried away
                Err(err @ (CoreError::BridgeNotFound { .. } | CoreError::BridgeMisconfigured { .. })) => {
                    return Err(err);
                }
                Err(err) => {
                    last_reason = format!("attempt {attempt}: {err}");
                    warn!(attempt, %err, "bridge start attempt failed");
                }
            }
            if attempt < START_ATTEMPTS {
                let delay_ms = 2000u64 * (1 << (attempt - 1));
                self.time.sleep(Duration::from_millis(delay_ms)).await;
            }
        }
        Err(CoreError::BridgeStartFailed {
            attempts: START_ATTEMPTS,
            reason: last_reason,
        })
    }

    /// Locates, configures, and spawns the bridge; readiness is asserted
    /// separately by [`Self::wait_for_ready`]
    pub async fn start(&self) -> Result<u32> {
        self.start_attempts.fetch_add(1, Ordering::SeqCst);

        let path = process::discover_executable(&self.executable)?;
        let (env, missing) = BridgeEnv::discover(&self.dotenv_candidates);
        if !missing.is_empty() {
            return Err(CoreError::BridgeMisconfigured { missing });
        }
        process::spawn_detached(&path, &env.vars)
    }

    /// Polls the health endpoint on the capped backoff schedule
    ///
    /// The scheduled-wait budget is 10s regardless of how the underlying
    /// clock behaves; cancellation aborts the loop promptly.
    pub async fn wait_for_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let mut scheduled_ms = 0u64;
        let mut step = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Timeout {
                    operation: "wait_for_ready".to_string(),
                    timeout_ms: scheduled_ms,
                });
            }
            match self
                .pool
                .get(PoolClass::Health, &self.health_url(), cancel)
                .await
            {
                Ok(response) if response.is_success() => {
                    self.set_cache(true);
                    return Ok(());
                }
                Ok(response) => {
                    debug!(status = response.status, "bridge not ready yet");
                }
                Err(err) => {
                    debug!(%err, "bridge health endpoint unreachable");
                }
            }

            let delay = READY_BACKOFF_MS[step.min(READY_BACKOFF_MS.len() - 1)];
            if scheduled_ms + delay > READY_BUDGET_MS {
                return Err(CoreError::BridgeStartFailed {
                    attempts: 1,
                    reason: format!("not ready within {READY_BUDGET_MS}ms"),
                });
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(CoreError::Timeout {
                        operation: "wait_for_ready".to_string(),
                        timeout_ms: scheduled_ms,
                    });
                }
                () = self.time.sleep(Duration::from_millis(delay)) => {}
            }
            scheduled_ms += delay;
            step += 1;
        }
    }

    /// Stops every bridge process and clears the cache
    pub async fn stop(&self) -> Result<usize> {
        let terminated = process::terminate_by_name(&self.executable).await;
        self.clear_cache();
        if terminated > 0 {
            info!(terminated, "bridge processes terminated");
        }
        Ok(terminated)
    }

    /// Stop, cool down, start, and gate on readiness
    pub async fn restart(&self, cancel: &CancellationToken) -> Result<u32> {
        self.stop().await?;
        self.time.sleep(Duration::from_secs(1)).await;
        let pid = self.start().await?;
        self.wait_for_ready(cancel).await?;
        self.set_cache(true);
        Ok(pid)
    }

    /// PID of a running bridge process, when one exists
    pub fn find_pid(&self) -> Option<u32> {
        process::find_pids_by_name(&self.executable)
            .into_iter()
            .next()
    }

    /// Full status: health JSON, Prometheus counters, process gauges
    pub async fn status(&self, cancel: &CancellationToken) -> BridgeStatus {
        let mut status = BridgeStatus::default();

        match self
            .pool
            .get(PoolClass::Status, &self.health_url(), cancel)
            .await
        {
            Ok(response) if response.is_success() => {
                status.running = true;
                if let Ok(body) = serde_json::from_str::<serde_json::Value>(&response.body) {
                    if let Some(health) = body.get("status").and_then(|v| v.as_str()) {
                        status.health = health.to_string();
                    }
                    status.last_event_time = body
                        .get("last_event_time")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    self.version_sync_check(&body);
                }
            }
            Ok(_) | Err(_) => {
                status.running = !process::find_pids_by_name(&self.executable).is_empty();
                status.health = if status.running {
                    "degraded".to_string()
                } else {
                    "unknown".to_string()
                };
            }
        }
        self.set_cache(status.running);

        if status.running {
            if let Ok(response) = self
                .pool
                .get(PoolClass::Status, &self.metrics_url(), cancel)
                .await
            {
                let metrics = parse_prometheus(&response.body);
                status.uptime_seconds = metrics.value("process_uptime_seconds") as u64;
                status.events_processed = metrics.value("events_processed_total") as u64;
                status.telegram_messages_sent = metrics.value("telegram_messages_sent_total") as u64;
                status.error_count = metrics.value("errors_total") as u64;
                status.memory_mb = metrics.value("memory_usage_bytes") / (1024.0 * 1024.0);
                status.cpu_pct = metrics.value("cpu_usage_percent") as f32;
            }

            status.pid = self.find_pid();
            if let Some(pid) = status.pid {
                if status.memory_mb == 0.0 {
                    if let Some((memory_mb, cpu_pct)) = sample_process(pid) {
                        status.memory_mb = memory_mb;
                        status.cpu_pct = cpu_pct;
                    }
                }
            }
        }
        status
    }

    /// Warns when the bridge build does not match this crate's version
    pub fn version_sync_check(&self, health_body: &serde_json::Value) {
        let Some(build_info) = health_body.get("build_info").and_then(|v| v.as_str()) else {
            return;
        };
        let ours = env!("CARGO_PKG_VERSION");
        if build_info != ours {
            warn!(
                bridge_build = build_info,
                core_version = ours,
                "bridge build does not match core version"
            );
        }
    }
}

struct PrometheusSamples(std::collections::HashMap<String, f64>);

impl PrometheusSamples {
    fn value(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }
}

/// Minimal Prometheus text parse: bare `name value` lines, labels ignored
fn parse_prometheus(body: &str) -> PrometheusSamples {
    let mut samples = std::collections::HashMap::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(name_part), Some(value_part)) = (parts.next(), parts.next()) else {
            continue;
        };
        let name = name_part.split('{').next().unwrap_or(name_part);
        if let Ok(value) = value_part.parse::<f64>() {
            samples.insert(name.to_string(), value);
        }
    }
    PrometheusSamples(samples)
}

/// Memory (MiB) and CPU (%) of one process
fn sample_process(pid: u32) -> Option<(f64, f32)> {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let process = system.process(pid)?;
    Some((
        process.memory() as f64 / (1024.0 * 1024.0),
        process.cpu_usage(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_parse_extracts_bare_and_labeled_samples() {
        let body = "\
# HELP process_uptime_seconds Uptime
# TYPE process_uptime_seconds gauge
process_uptime_seconds 321
events_processed_total{source=\"agent\"} 42
errors_total 3
malformed line without value
";
        let samples = parse_prometheus(body);
        assert_eq!(samples.value("process_uptime_seconds"), 321.0);
        assert_eq!(samples.value("events_processed_total"), 42.0);
        assert_eq!(samples.value("errors_total"), 3.0);
        assert_eq!(samples.value("missing_metric"), 0.0);
    }

    #[test]
    fn ensure_outcome_names_match_tool_contract() {
        assert_eq!(EnsureOutcome::AlreadyRunning.as_str(), "already_running");
        assert_eq!(EnsureOutcome::Started.as_str(), "started");
    }
}
