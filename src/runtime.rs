//! Composition root
//!
//! Builds every component exactly once, wires them through the signal bus,
//! and owns the background loops (buffer-pool GC, alert intake, escalation,
//! dispatch). There is no global mutable state: everything a handler can
//! reach hangs off the `Components` struct built here.

use crate::alerting::AlertEngine;
use crate::bridge::BridgeManager;
use crate::buffer_pool::BufferPool;
use crate::bus::SignalBus;
use crate::config::{BridgeEnv, Config, HealthEndpointConfig};
use crate::dispatch::{Components, ToolDispatcher};
use crate::error::{CoreError, Result};
use crate::events::{EventLedger, EventPipeline};
use crate::observability::{
    HealthChecker, MetricsRegistry, StructuredLogger, ThresholdWatch, Tracer,
};
use crate::ratelimit::RateLimiter;
use crate::resilience::HttpClientPool;
use crate::responses::ResponseEngine;
use crate::security::{Sanitizer, SecurityMonitor};
use crate::tasks::TaskAggregator;
use crate::time_provider::SharedTimeProvider;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default threshold watchers over the core's own metrics
fn default_watchers() -> Vec<ThresholdWatch> {
    vec![
        ThresholdWatch {
            metric: "event_write_failures_total".to_string(),
            warning: 5.0,
            critical: 20.0,
            duration_secs: 0,
        },
        ThresholdWatch {
            metric: "security_blocked_total".to_string(),
            warning: 10.0,
            critical: 50.0,
            duration_secs: 0,
        },
    ]
}

/// The assembled application
pub struct CoreRuntime {
    pub components: Arc<Components>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub alerts: Arc<AlertEngine>,
    pub buffer_pool: Arc<BufferPool>,
    pub health: Arc<HealthChecker>,
    pub bus: SignalBus,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl CoreRuntime {
    /// Builds the full component graph from one immutable configuration
    pub fn build(config: Config, time: SharedTimeProvider) -> Result<Self> {
        config.validate().map_err(|err| CoreError::Internal {
            message: format!("configuration rejected: {err}"),
        })?;
        let config = Arc::new(config);
        let bus = SignalBus::new();

        let sanitizer = config
            .log
            .secure_logging
            .then(|| Sanitizer::new(&config.security.suspicious_patterns))
            .transpose()?
            .map(Arc::new);
        let logger = Arc::new(StructuredLogger::new(
            &config.environment,
            sanitizer,
            bus.publisher(),
            time.clone(),
        )?);
        let metrics = Arc::new(MetricsRegistry::new(
            default_watchers(),
            bus.publisher(),
            time.clone(),
        ));
        let tracer = Arc::new(Tracer::new(1.0, time.clone()));

        let http_pool = Arc::new(HttpClientPool::new(
            config.retry.clone(),
            config.breaker.clone(),
            time.clone(),
        )?);
        let buffer_pool = Arc::new(BufferPool::new(
            config.buffer_pool.clone(),
            bus.publisher(),
        ));

        let bridge = Arc::new(BridgeManager::new(
            &config.bridge_executable,
            &config.bridge_base_url(),
            BridgeEnv::default_candidates(),
            Arc::clone(&http_pool),
            time.clone(),
        ));

        let ledger = Arc::new(EventLedger::new());
        let pipeline = Arc::new(EventPipeline::new(
            config.events_dir.clone(),
            Arc::clone(&bridge),
            Arc::clone(&buffer_pool),
            Arc::clone(&metrics),
            Arc::clone(&ledger),
            time.clone(),
        ));
        let responses = Arc::new(ResponseEngine::new(
            config.responses_dir.clone(),
            Arc::clone(&ledger),
            time.clone(),
        )?);

        // an empty endpoint list still watches the bridge itself
        let mut health_config = config.health.clone();
        if health_config.endpoints.is_empty() {
            health_config.endpoints.push(HealthEndpointConfig {
                name: "bridge".to_string(),
                url: format!("{}/health", config.bridge_base_url()),
                method: "GET".to_string(),
                expected_status: vec![200],
                timeout_ms: 2000,
                retries: 0,
                critical: true,
            });
        }
        let health = Arc::new(HealthChecker::new(
            health_config,
            Arc::clone(&http_pool),
            bus.publisher(),
            time.clone(),
        ));

        let ratelimit = Arc::new(RateLimiter::new(config.rate_limit.clone(), time.clone()));
        let security = Arc::new(SecurityMonitor::new(
            config.security.clone(),
            bus.publisher(),
            time.clone(),
        )?);
        let alerts = Arc::new(AlertEngine::new(
            config.alerting.clone(),
            &config.events_dir,
            time.clone(),
        )?);

        let components = Arc::new(Components {
            config: Arc::clone(&config),
            pipeline,
            bridge,
            responses,
            tasks: TaskAggregator::new(),
            ledger,
            metrics,
            logger,
            tracer,
            publisher: bus.publisher(),
            time,
        });
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::clone(&components),
            ratelimit,
            security,
        ));

        Ok(Self {
            components,
            dispatcher,
            alerts,
            buffer_pool,
            health,
            bus,
            shutdown: CancellationToken::new(),
            background: Vec::new(),
        })
    }

    /// Spawns the background loops
    pub fn start_background(&mut self) {
        let shutdown = self.shutdown.clone();
        self.background.push(tokio::spawn(
            Arc::clone(&self.buffer_pool).run_gc_loop(shutdown.clone()),
        ));
        self.background.push(tokio::spawn(
            Arc::clone(&self.alerts).run_intake_loop(self.bus.subscribe(), shutdown.clone()),
        ));
        self.background.push(tokio::spawn(
            Arc::clone(&self.alerts).run_escalation_loop(shutdown.clone()),
        ));
        self.background.push(tokio::spawn(
            Arc::clone(&self.alerts).run_dispatch_loop(shutdown.clone()),
        ));
        self.background.push(tokio::spawn(
            Arc::clone(&self.health)
                .run_probe_loop(std::time::Duration::from_secs(30), shutdown),
        ));
        info!("background loops started");
    }

    /// Cancellation token shared with every loop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops every background loop and waits for them to finish
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for handle in self.background.drain(..) {
            let _ = handle.await;
        }
        info!("runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;

    #[tokio::test]
    async fn runtime_builds_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            events_dir: dir.path().join("events"),
            responses_dir: dir.path().join("responses"),
            ..Config::development()
        };
        let mut runtime = CoreRuntime::build(config, test_time_provider()).unwrap();
        runtime.start_background();
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_build() {
        let config = Config {
            enable_auth: true,
            default_api_key: None,
            ..Config::development()
        };
        assert!(CoreRuntime::build(config, test_time_provider()).is_err());
    }
}
