//! Structured, correlated, sanitized logging
//!
//! Records carry the correlation id injected per invocation plus optional
//! trace/span ids. With secure logging enabled, messages and metadata pass
//! through the sanitizer before emission. Repeated messages are normalized
//! into patterns and aggregated; a pattern crossing its threshold inside the
//! window emits a bus signal instead of flooding the sink.

use crate::bus::{Signal, SignalPublisher};
use crate::config::{LogConfig, LogFormat};
use crate::domain_types::CorrelationId;
use crate::error::{CoreError, Result};
use crate::security::Sanitizer;
use crate::time_provider::SharedTimeProvider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exemplars kept per aggregated pattern
const MAX_EXEMPLARS: usize = 5;

/// Aggregation window
const AGGREGATION_WINDOW_SECS: u64 = 60;

/// Occurrences within the window before the aggregation signal fires
const AGGREGATION_THRESHOLD: u64 = 10;

/// Record severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log record
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub level: RecordLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub service: String,
    pub version: String,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Builder-style parameters for one record
#[derive(Debug, Default)]
pub struct RecordParams {
    pub component: Option<String>,
    pub operation: Option<String>,
    pub duration_ms: Option<u64>,
    pub metadata: Option<Value>,
    pub error: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

struct AggregationEntry {
    count: u64,
    window_started_ms: u64,
    exemplars: Vec<String>,
    signalled: bool,
}

/// The component-facing logger
pub struct StructuredLogger {
    service: String,
    version: String,
    environment: String,
    sanitizer: Option<Arc<Sanitizer>>,
    patterns: DashMap<String, AggregationEntry>,
    normalizers: Vec<(Regex, &'static str)>,
    publisher: SignalPublisher,
    time: SharedTimeProvider,
}

impl StructuredLogger {
    /// Creates the logger; `sanitizer` is attached when secure logging is on
    pub fn new(
        environment: &str,
        sanitizer: Option<Arc<Sanitizer>>,
        publisher: SignalPublisher,
        time: SharedTimeProvider,
    ) -> Result<Self> {
        let normalizers = vec![
            (compile(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")?, "UUID"),
            (compile(r"[0-9a-fA-F]{32}")?, "UUID"),
            (compile(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b")?, "IP"),
            (compile(r"(/[\w.-]+)+")?, "/PATH"),
            (compile(r"\d+")?, "N"),
        ];
        Ok(Self {
            service: "telebridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: environment.to_string(),
            sanitizer,
            patterns: DashMap::new(),
            normalizers,
            publisher,
            time,
        })
    }

    /// Builds, sanitizes, aggregates, and emits one record
    pub fn log(
        &self,
        level: RecordLevel,
        message: &str,
        correlation_id: CorrelationId,
        params: RecordParams,
    ) -> LogRecord {
        let mut message = message.to_string();
        let mut metadata = params.metadata.unwrap_or(Value::Null);
        if let Some(sanitizer) = &self.sanitizer {
            message = sanitizer.sanitize_message(&message);
            sanitizer.sanitize_value(&mut metadata);
        }

        let record = LogRecord {
            level,
            message,
            timestamp: self.time.now_utc(),
            correlation_id,
            trace_id: params.trace_id,
            span_id: params.span_id,
            service: self.service.clone(),
            version: self.version.clone(),
            environment: self.environment.clone(),
            component: params.component,
            operation: params.operation,
            duration_ms: params.duration_ms,
            metadata,
            error: params.error,
        };

        self.aggregate(&record.message);
        emit(&record);
        record
    }

    /// Normalizes a message into its aggregation pattern
    pub fn normalize(&self, message: &str) -> String {
        let mut pattern = message.to_string();
        for (regex, replacement) in &self.normalizers {
            pattern = regex.replace_all(&pattern, *replacement).into_owned();
        }
        pattern
    }

    /// Occurrence count of a pattern within the current window
    pub fn pattern_count(&self, pattern: &str) -> u64 {
        self.patterns.get(pattern).map(|e| e.count).unwrap_or(0)
    }

    fn aggregate(&self, message: &str) {
        let pattern = self.normalize(message);
        let now_ms = self.time.epoch_millis();
        let window_ms = AGGREGATION_WINDOW_SECS * 1000;

        let mut entry = self
            .patterns
            .entry(pattern.clone())
            .or_insert(AggregationEntry {
                count: 0,
                window_started_ms: now_ms,
                exemplars: Vec::new(),
                signalled: false,
            });

        if now_ms.saturating_sub(entry.window_started_ms) > window_ms {
            entry.count = 0;
            entry.window_started_ms = now_ms;
            entry.exemplars.clear();
            entry.signalled = false;
        }

        entry.count += 1;
        if entry.exemplars.len() < MAX_EXEMPLARS {
            entry.exemplars.push(message.to_string());
        }

        if entry.count >= AGGREGATION_THRESHOLD && !entry.signalled {
            entry.signalled = true;
            self.publisher.publish(Signal::LogAggregation {
                pattern,
                count: entry.count,
                window_secs: AGGREGATION_WINDOW_SECS,
                at: self.time.now_utc(),
            });
        }
    }
}

/// Hands the record to the active `tracing` subscriber
fn emit(record: &LogRecord) {
    let payload = serde_json::to_string(record).unwrap_or_else(|_| record.message.clone());
    match record.level {
        RecordLevel::Debug => debug!(target: "telebridge::structured", record = %payload),
        RecordLevel::Info => info!(target: "telebridge::structured", record = %payload),
        RecordLevel::Warn => warn!(target: "telebridge::structured", record = %payload),
        RecordLevel::Error => error!(target: "telebridge::structured", record = %payload),
    }
}

/// Initializes the global `tracing` subscriber per the log configuration
///
/// Call once from the binary entry point; tests use `test-log` instead.
pub fn init_subscriber(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("telebridge={}", config.level.as_directive()))
    });

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .try_init(),
        LogFormat::Simple => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .try_init(),
    };
    result.map_err(|err| CoreError::Internal {
        message: format!("failed to initialize log subscriber: {err}"),
    })
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| CoreError::Internal {
        message: format!("logger normalizer pattern failed to compile: {err}"),
    })
}
