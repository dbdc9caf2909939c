//! Alerting engine: rules, fingerprints, suppression, escalation, dispatch
//!
//! Signals arrive from the bus (threshold violations, security events,
//! health transitions, SLA misses). Each one is matched against the rule
//! set, folded into at most one unresolved alert per fingerprint, passed
//! through suppression, and fanned out to severity-matched channels. A
//! once-a-minute escalation pass widens the channel set of long-firing
//! alerts; a dispatch loop drains the bounded notification queue with
//! per-notification retry.

pub mod channels;

pub use channels::AlertChannel;

use crate::bus::Signal;
use crate::config::AlertingConfig;
use crate::domain_types::Severity;
use crate::error::Result;
use crate::time_provider::SharedTimeProvider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Alert lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
    Suppressed,
    Acknowledged,
}

/// One alert instance
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub rule: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub metric: String,
    pub current_value: f64,
    pub threshold_value: f64,
    pub duration_ms: u64,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub fingerprint: String,
    pub escalation_level: u32,
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression_reason: Option<String>,
}

/// Suppression condition operators
#[derive(Debug, Clone)]
pub enum SuppressOp {
    Equals(String),
    Contains(String),
    Matches(Regex),
    Gt(f64),
    Lt(f64),
}

/// One suppression rule over an alert field
#[derive(Debug, Clone)]
pub struct SuppressionRule {
    /// `rule`, `metric`, `severity`, or a label name
    pub field: String,
    pub op: SuppressOp,
}

impl SuppressionRule {
    fn matches(&self, alert: &Alert) -> bool {
        let value: Option<String> = match self.field.as_str() {
            "rule" => Some(alert.rule.clone()),
            "metric" => Some(alert.metric.clone()),
            "severity" => Some(alert.severity.as_str().to_string()),
            label => alert.labels.get(label).cloned(),
        };
        let Some(value) = value else { return false };
        match &self.op {
            SuppressOp::Equals(expected) => value == *expected,
            SuppressOp::Contains(needle) => value.contains(needle),
            SuppressOp::Matches(regex) => regex.is_match(&value),
            SuppressOp::Gt(threshold) => value.parse::<f64>().is_ok_and(|v| v > *threshold),
            SuppressOp::Lt(threshold) => value.parse::<f64>().is_ok_and(|v| v < *threshold),
        }
    }
}

/// Pending channel notification
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: String,
    pub alert_id: String,
    pub fingerprint: String,
    pub channel: String,
    pub severity: Severity,
    pub attempts: u32,
    pub status: NotificationStatus,
}

/// Delivery state of one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

/// Counters exposed to the status surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertingStats {
    pub active: usize,
    pub queued: usize,
    pub sent_total: u64,
    pub failed_total: u64,
    pub suppressed_total: u64,
}

/// The engine
pub struct AlertEngine {
    config: AlertingConfig,
    channels: Vec<AlertChannel>,
    suppression_rules: Vec<SuppressionRule>,
    /// fingerprint -> alert in a non-resolved state
    active: DashMap<String, Alert>,
    history: Mutex<VecDeque<Alert>>,
    queue: Mutex<VecDeque<Notification>>,
    /// fingerprint -> last creation epoch millis, for the duplicate window
    recent: DashMap<String, u64>,
    /// creation timestamps for the per-minute ceiling
    minute_window: Mutex<Vec<u64>>,
    channel_failures: DashMap<String, u64>,
    sent_total: std::sync::atomic::AtomicU64,
    failed_total: std::sync::atomic::AtomicU64,
    suppressed_total: std::sync::atomic::AtomicU64,
    http: reqwest::Client,
    time: SharedTimeProvider,
}

/// History depth for resolved alerts
const HISTORY_DEPTH: usize = 500;

/// Delivery retry cap per notification
const DISPATCH_ATTEMPTS: u32 = 3;

impl AlertEngine {
    /// Builds the engine: channels from config, empty state
    pub fn new(
        config: AlertingConfig,
        events_dir: &std::path::Path,
        time: SharedTimeProvider,
    ) -> Result<Self> {
        let mut channels = Vec::new();
        for channel_config in &config.channels {
            channels.push(AlertChannel::from_config(channel_config, events_dir)?);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| crate::error::CoreError::Internal {
                message: format!("failed to build alert dispatch client: {err}"),
            })?;
        Ok(Self {
            config,
            channels,
            suppression_rules: Vec::new(),
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            queue: Mutex::new(VecDeque::new()),
            recent: DashMap::new(),
            minute_window: Mutex::new(Vec::new()),
            channel_failures: DashMap::new(),
            sent_total: std::sync::atomic::AtomicU64::new(0),
            failed_total: std::sync::atomic::AtomicU64::new(0),
            suppressed_total: std::sync::atomic::AtomicU64::new(0),
            http,
            time,
        })
    }

    /// Installs suppression rules (first match suppresses)
    pub fn set_suppression_rules(&mut self, rules: Vec<SuppressionRule>) {
        self.suppression_rules = rules;
    }

    /// Consumes bus signals until cancelled
    pub async fn run_intake_loop(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<Signal>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(signal) => self.handle_signal(&signal),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "alert intake lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("alert intake loop stopped");
    }

    /// Maps one bus signal onto the rule set
    pub fn handle_signal(&self, signal: &Signal) {
        match signal {
            Signal::ThresholdViolation {
                metric,
                current_value,
                threshold,
                severity,
                labels,
                ..
            } => {
                let labels: BTreeMap<String, String> =
                    labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                // configured rules refine severity/threshold for known metrics
                let matched = self
                    .config
                    .rules
                    .iter()
                    .filter(|rule| rule.metric == *metric)
                    .find(|rule| evaluate(&rule.condition, *current_value, rule.threshold));
                if let Some(rule) = matched {
                    self.ingest(
                        &rule.name,
                        metric,
                        "metrics",
                        *current_value,
                        rule.threshold,
                        rule.severity,
                        &labels,
                    );
                } else {
                    self.ingest(
                        &format!("threshold:{metric}"),
                        metric,
                        "metrics",
                        *current_value,
                        *threshold,
                        *severity,
                        &labels,
                    );
                }
                // a configured rule whose condition cleared resolves its alert
                for rule in self.config.rules.iter().filter(|r| r.metric == *metric) {
                    if !evaluate(&rule.condition, *current_value, rule.threshold) {
                        self.resolve_rule(&rule.name, metric, "metrics", &labels);
                    }
                }
            }
            Signal::SecurityEvent {
                rule,
                severity,
                detail,
                client_id,
                ..
            } => {
                let mut labels = BTreeMap::new();
                if let Some(client) = client_id {
                    labels.insert("client".to_string(), client.clone());
                }
                labels.insert("detail".to_string(), detail.clone());
                self.ingest(
                    &format!("security:{rule}"),
                    "security_events_total",
                    "security",
                    1.0,
                    0.0,
                    *severity,
                    &labels,
                );
            }
            Signal::HealthTransition { endpoint, from, to, .. } => {
                let mut labels = BTreeMap::new();
                labels.insert("endpoint".to_string(), endpoint.clone());
                labels.insert("from".to_string(), from.clone());
                if to == "unhealthy" {
                    self.ingest(
                        &format!("health:{endpoint}"),
                        "endpoint_health",
                        "health",
                        0.0,
                        1.0,
                        Severity::High,
                        &labels,
                    );
                } else if to == "healthy" {
                    self.resolve_rule(&format!("health:{endpoint}"), "endpoint_health", "health", &labels);
                }
            }
            Signal::MemoryPressure { resident_mb, limit_mb, .. } => {
                self.ingest(
                    "memory_pressure",
                    "memory_usage_mb",
                    "buffer_pool",
                    *resident_mb as f64,
                    *limit_mb as f64,
                    Severity::High,
                    &BTreeMap::new(),
                );
            }
            Signal::SlaViolation {
                operation,
                duration_ms,
                budget_ms,
                ..
            } => {
                let mut labels = BTreeMap::new();
                labels.insert("operation".to_string(), operation.clone());
                self.ingest(
                    &format!("sla:{operation}"),
                    "operation_duration_ms",
                    "sla",
                    *duration_ms as f64,
                    *budget_ms as f64,
                    Severity::Medium,
                    &labels,
                );
            }
            Signal::LogAggregation { pattern, count, .. } => {
                let mut labels = BTreeMap::new();
                labels.insert("pattern".to_string(), pattern.clone());
                self.ingest(
                    "log_flood",
                    "log_pattern_repeats",
                    "logger",
                    *count as f64,
                    0.0,
                    Severity::Low,
                    &labels,
                );
            }
        }
    }

    /// Folds a signal into the per-fingerprint alert state
    #[allow(clippy::too_many_arguments)]
    fn ingest(
        &self,
        rule: &str,
        metric: &str,
        source: &str,
        current_value: f64,
        threshold_value: f64,
        severity: Severity,
        labels: &BTreeMap<String, String>,
    ) {
        let now = self.time.now_utc();
        let fingerprint = fingerprint(rule, metric, source, labels);

        if let Some(mut existing) = self.active.get_mut(&fingerprint) {
            existing.current_value = current_value;
            existing.updated_at = now;
            debug!(fingerprint = %fingerprint, "updated existing alert");
            return;
        }

        let mut alert = Alert {
            id: Uuid::new_v4().simple().to_string(),
            rule: rule.to_string(),
            title: format!("{rule}: {metric}"),
            description: format!(
                "{metric} = {current_value} (threshold {threshold_value}) from {source}"
            ),
            severity,
            status: AlertStatus::Firing,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            acknowledged_at: None,
            metric: metric.to_string(),
            current_value,
            threshold_value,
            duration_ms: 0,
            labels: labels.clone(),
            annotations: BTreeMap::new(),
            fingerprint: fingerprint.clone(),
            escalation_level: 0,
            channels: Vec::new(),
            suppression_reason: None,
        };

        if let Some(reason) = self.suppression_reason(&alert) {
            alert.status = AlertStatus::Suppressed;
            alert.suppression_reason = Some(reason.clone());
            self.suppressed_total
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            info!(fingerprint = %fingerprint, %reason, "alert suppressed");
            self.active.insert(fingerprint.clone(), alert);
            self.recent
                .insert(fingerprint, self.time.epoch_millis());
            return;
        }

        info!(
            rule = %alert.rule,
            severity = %alert.severity,
            fingerprint = %fingerprint,
            "alert firing"
        );
        self.record_creation();
        self.recent.insert(fingerprint.clone(), self.time.epoch_millis());
        self.enqueue_for_channels(&mut alert, None);
        self.active.insert(fingerprint, alert);
    }

    /// Resolves the alert for a rule when its condition has cleared
    fn resolve_rule(
        &self,
        rule: &str,
        metric: &str,
        source: &str,
        labels: &BTreeMap<String, String>,
    ) {
        let fingerprint = fingerprint(rule, metric, source, labels);
        self.resolve_fingerprint(&fingerprint);
    }

    /// Transitions one fingerprint's alert to resolved
    pub fn resolve_fingerprint(&self, fingerprint: &str) -> bool {
        let Some((_, mut alert)) = self.active.remove(fingerprint) else {
            return false;
        };
        let now = self.time.now_utc();
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.updated_at = now;
        info!(rule = %alert.rule, fingerprint = %fingerprint, "alert resolved");
        self.push_history(alert);
        true
    }

    /// Acknowledges a firing alert; resolved alerts cannot be acknowledged
    pub fn acknowledge(&self, alert_id: &str) -> bool {
        for mut entry in self.active.iter_mut() {
            if entry.id == alert_id && entry.status == AlertStatus::Firing {
                let now = self.time.now_utc();
                entry.status = AlertStatus::Acknowledged;
                entry.acknowledged_at = Some(now);
                entry.updated_at = now;
                return true;
            }
        }
        false
    }

    /// One escalation pass; called once a minute by the loop
    pub fn escalate_once(&self) {
        let now = self.time.now_utc();

        // collect first: enqueueing must not run under the map's shard locks
        let due: Vec<String> = self
            .active
            .iter()
            .filter(|entry| entry.status == AlertStatus::Firing)
            .filter_map(|entry| {
                let next = self
                    .config
                    .escalation_levels
                    .get(entry.escalation_level as usize)?;
                let age = now
                    .signed_duration_since(entry.created_at)
                    .num_seconds()
                    .max(0) as u64;
                (age >= next.delay_secs).then(|| entry.fingerprint.clone())
            })
            .collect();

        for fingerprint in due {
            let mut alert = {
                let Some(mut entry) = self.active.get_mut(&fingerprint) else {
                    continue;
                };
                let Some(next) = self
                    .config
                    .escalation_levels
                    .get(entry.escalation_level as usize)
                else {
                    continue;
                };
                entry.escalation_level += 1;
                entry.updated_at = now;
                info!(
                    rule = %entry.rule,
                    level = entry.escalation_level,
                    channels = ?next.channels,
                    "alert escalated"
                );
                entry.value().clone()
            };

            let level_channels = self
                .config
                .escalation_levels
                .get((alert.escalation_level - 1) as usize)
                .map(|l| l.channels.clone())
                .unwrap_or_default();
            self.enqueue_for_channels(&mut alert, Some(&level_channels));
            if let Some(mut entry) = self.active.get_mut(&fingerprint) {
                entry.channels = alert.channels.clone();
            }
        }
    }

    /// Runs escalation once per minute until cancelled
    pub async fn run_escalation_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.time.sleep(Duration::from_secs(60)) => self.escalate_once(),
            }
        }
        debug!("escalation loop stopped");
    }

    /// Drains the queue until cancelled
    pub async fn run_dispatch_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.time.sleep(Duration::from_millis(500)) => {
                    self.dispatch_pending().await;
                }
            }
        }
        debug!("alert dispatch loop stopped");
    }

    /// Sends every queued notification, retrying each up to the cap
    pub async fn dispatch_pending(&self) {
        loop {
            let Some(mut notification) = self.pop_notification() else {
                break;
            };
            let Some(alert) = self.alert_snapshot(&notification.fingerprint) else {
                continue;
            };
            let Some(channel) = self
                .channels
                .iter()
                .find(|c| c.name() == notification.channel)
            else {
                continue;
            };

            let mut delivered = false;
            while notification.attempts < DISPATCH_ATTEMPTS {
                notification.attempts += 1;
                match channel.send(&alert, &self.http).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            channel = %notification.channel,
                            attempt = notification.attempts,
                            %err,
                            "notification send failed"
                        );
                        if notification.attempts < DISPATCH_ATTEMPTS {
                            let backoff = Duration::from_millis(
                                250u64.saturating_mul(1 << (notification.attempts - 1)),
                            );
                            self.time.sleep(backoff).await;
                        }
                    }
                }
            }

            if delivered {
                notification.status = NotificationStatus::Sent;
                self.sent_total
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            } else {
                notification.status = NotificationStatus::Failed;
                self.failed_total
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                *self
                    .channel_failures
                    .entry(notification.channel.clone())
                    .or_insert(0) += 1;
            }
        }
    }

    /// Active (non-resolved) alerts
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Engine counters
    pub fn stats(&self) -> AlertingStats {
        AlertingStats {
            active: self.active.len(),
            queued: self.queue.lock().map(|q| q.len()).unwrap_or(0),
            sent_total: self.sent_total.load(std::sync::atomic::Ordering::SeqCst),
            failed_total: self.failed_total.load(std::sync::atomic::Ordering::SeqCst),
            suppressed_total: self
                .suppressed_total
                .load(std::sync::atomic::Ordering::SeqCst),
        }
    }

    /// Failure count per channel
    pub fn channel_failures(&self, channel: &str) -> u64 {
        self.channel_failures.get(channel).map(|v| *v).unwrap_or(0)
    }

    fn suppression_reason(&self, alert: &Alert) -> Option<String> {
        for rule in &self.suppression_rules {
            if rule.matches(alert) {
                return Some(format!("suppression rule on field {}", rule.field));
            }
        }

        let now_ms = self.time.epoch_millis();
        if let Some(last) = self.recent.get(&alert.fingerprint) {
            let window_ms = self.config.duplicate_window_secs * 1000;
            if now_ms.saturating_sub(*last) < window_ms {
                return Some("duplicate within window".to_string());
            }
        }

        let ceiling = self.config.max_alerts_per_minute as usize;
        let created_last_minute = self
            .minute_window
            .lock()
            .map(|window| {
                window
                    .iter()
                    .filter(|ts| now_ms.saturating_sub(**ts) < 60_000)
                    .count()
            })
            .unwrap_or(0);
        if created_last_minute >= ceiling {
            return Some("per-minute ceiling reached".to_string());
        }

        None
    }

    fn record_creation(&self) {
        let now_ms = self.time.epoch_millis();
        if let Ok(mut window) = self.minute_window.lock() {
            window.retain(|ts| now_ms.saturating_sub(*ts) < 60_000);
            window.push(now_ms);
        }
    }

    /// Queues notifications for every accepting channel; `restrict` narrows
    /// to newly-added escalation channels
    fn enqueue_for_channels(&self, alert: &mut Alert, restrict: Option<&[String]>) {
        for channel in &self.channels {
            if let Some(allowed) = restrict {
                if !allowed.iter().any(|name| name == channel.name()) {
                    continue;
                }
            }
            if !channel.accepts(alert.severity) {
                continue;
            }
            if alert.channels.iter().any(|name| name == channel.name()) {
                continue;
            }
            alert.channels.push(channel.name().to_string());
            self.push_notification(Notification {
                id: Uuid::new_v4().simple().to_string(),
                alert_id: alert.id.clone(),
                fingerprint: alert.fingerprint.clone(),
                channel: channel.name().to_string(),
                severity: alert.severity,
                attempts: 0,
                status: NotificationStatus::Pending,
            });
        }
    }

    /// Bounded push; overflow evicts the lowest-severity pending entry
    fn push_notification(&self, notification: Notification) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        if queue.len() >= self.config.dispatch_queue_limit {
            let lowest = queue
                .iter()
                .enumerate()
                .min_by_key(|(_, n)| n.severity)
                .map(|(idx, _)| idx);
            match lowest {
                Some(idx) if queue[idx].severity <= notification.severity => {
                    let dropped = queue.remove(idx);
                    if let Some(dropped) = dropped {
                        warn!(
                            channel = %dropped.channel,
                            severity = %dropped.severity,
                            "notification queue full, dropped lowest severity"
                        );
                    }
                }
                _ => {
                    warn!("notification queue full, new notification dropped");
                    return;
                }
            }
        }
        queue.push_back(notification);
    }

    fn pop_notification(&self) -> Option<Notification> {
        self.queue.lock().ok()?.pop_front()
    }

    fn alert_snapshot(&self, fingerprint: &str) -> Option<Alert> {
        self.active.get(fingerprint).map(|a| a.value().clone())
    }

    fn push_history(&self, alert: Alert) {
        if let Ok(mut history) = self.history.lock() {
            history.push_back(alert);
            while history.len() > HISTORY_DEPTH {
                history.pop_front();
            }
        }
    }
}

/// 16-hex-char dedup fingerprint over rule + metric + source + labels
pub fn fingerprint(
    rule: &str,
    metric: &str,
    source: &str,
    labels: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(metric.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(source.as_bytes());
    for (key, value) in labels {
        hasher.update(b"\x1f");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Evaluates a rule condition against a threshold
pub fn evaluate(condition: &str, value: f64, threshold: f64) -> bool {
    match condition {
        "gt" => value > threshold,
        "gte" => value >= threshold,
        "lt" => value < threshold,
        "lte" => value <= threshold,
        "eq" => (value - threshold).abs() < f64::EPSILON,
        "ne" => (value - threshold).abs() >= f64::EPSILON,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertChannelConfig, AlertingConfig, EscalationLevelConfig};
    use crate::time_provider::test_time_provider;

    fn engine(config: AlertingConfig) -> AlertEngine {
        let dir = tempfile::tempdir().unwrap();
        AlertEngine::new(config, dir.path(), test_time_provider()).unwrap()
    }

    fn base_config() -> AlertingConfig {
        AlertingConfig {
            channels: vec![AlertChannelConfig {
                name: "ops-telegram".to_string(),
                kind: "telegram".to_string(),
                target: String::new(),
                severities: Vec::new(),
            }],
            ..AlertingConfig::default()
        }
    }

    fn violation(metric: &str, value: f64) -> Signal {
        Signal::ThresholdViolation {
            metric: metric.to_string(),
            current_value: value,
            threshold: 10.0,
            severity: Severity::High,
            labels: std::collections::HashMap::new(),
            at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_is_16_hex_chars_and_stable() {
        let labels: BTreeMap<String, String> =
            [("tool".to_string(), "send_event".to_string())].into();
        let a = fingerprint("errors_high", "errors_total", "metrics", &labels);
        let b = fingerprint("errors_high", "errors_total", "metrics", &labels);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn one_unresolved_alert_per_fingerprint() {
        let engine = engine(base_config());
        engine.handle_signal(&violation("errors_total", 20.0));
        engine.handle_signal(&violation("errors_total", 30.0));

        let alerts = engine.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].current_value, 30.0);
    }

    #[test]
    fn resolve_then_retrigger_creates_a_new_alert() {
        let engine = engine(AlertingConfig {
            duplicate_window_secs: 0,
            ..base_config()
        });
        engine.handle_signal(&violation("errors_total", 20.0));
        let fp = engine.active_alerts()[0].fingerprint.clone();
        assert!(engine.resolve_fingerprint(&fp));
        assert!(engine.active_alerts().is_empty());

        engine.handle_signal(&violation("errors_total", 25.0));
        assert_eq!(engine.active_alerts().len(), 1);
    }

    #[test]
    fn resolved_alert_cannot_be_acknowledged() {
        let engine = engine(base_config());
        engine.handle_signal(&violation("errors_total", 20.0));
        let alert = engine.active_alerts()[0].clone();
        assert!(engine.resolve_fingerprint(&alert.fingerprint));
        assert!(!engine.acknowledge(&alert.id));
    }

    #[test]
    fn firing_alert_can_be_acknowledged() {
        let engine = engine(base_config());
        engine.handle_signal(&violation("errors_total", 20.0));
        let alert = engine.active_alerts()[0].clone();
        assert!(engine.acknowledge(&alert.id));
        let after = engine.active_alerts();
        assert_eq!(after[0].status, AlertStatus::Acknowledged);
        assert!(after[0].acknowledged_at.is_some());
    }

    #[test]
    fn duplicate_window_suppresses_retrigger() {
        let engine = engine(base_config());
        engine.handle_signal(&violation("errors_total", 20.0));
        let fp = engine.active_alerts()[0].fingerprint.clone();
        engine.resolve_fingerprint(&fp);

        // same fingerprint again inside the 5-minute window
        engine.handle_signal(&violation("errors_total", 22.0));
        let alerts = engine.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Suppressed);
        assert_eq!(
            alerts[0].suppression_reason.as_deref(),
            Some("duplicate within window")
        );
    }

    #[test]
    fn suppression_rule_matches_on_field() {
        let mut engine = engine(base_config());
        engine.set_suppression_rules(vec![SuppressionRule {
            field: "metric".to_string(),
            op: SuppressOp::Contains("noisy".to_string()),
        }]);
        engine.handle_signal(&violation("noisy_metric", 20.0));
        let alerts = engine.active_alerts();
        assert_eq!(alerts[0].status, AlertStatus::Suppressed);
    }

    #[test]
    fn per_minute_ceiling_suppresses_overflow() {
        let engine = engine(AlertingConfig {
            max_alerts_per_minute: 2,
            ..base_config()
        });
        for i in 0..4 {
            engine.handle_signal(&violation(&format!("metric_{i}"), 20.0));
        }
        let suppressed = engine
            .active_alerts()
            .iter()
            .filter(|a| a.status == AlertStatus::Suppressed)
            .count();
        assert_eq!(suppressed, 2);
    }

    #[test]
    fn escalation_adds_level_channels_without_duplicates() {
        let engine = engine(AlertingConfig {
            escalation_levels: vec![EscalationLevelConfig {
                delay_secs: 0,
                channels: vec!["ops-telegram".to_string()],
            }],
            ..base_config()
        });
        engine.handle_signal(&violation("errors_total", 20.0));
        let before = engine.active_alerts()[0].channels.clone();
        assert_eq!(before, vec!["ops-telegram".to_string()]);

        engine.escalate_once();
        let after = engine.active_alerts()[0].clone();
        assert_eq!(after.escalation_level, 1);
        // already-notified channel is not duplicated
        assert_eq!(after.channels, vec!["ops-telegram".to_string()]);
    }

    #[tokio::test]
    async fn failed_dispatch_exhausts_retries_and_counts_against_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let config = AlertingConfig {
            channels: vec![AlertChannelConfig {
                name: "ops-webhook".to_string(),
                kind: "webhook".to_string(),
                // nothing listens here
                target: "http://127.0.0.1:1/hook".to_string(),
                severities: Vec::new(),
            }],
            ..AlertingConfig::default()
        };
        let engine = AlertEngine::new(config, dir.path(), test_time_provider()).unwrap();
        engine.handle_signal(&violation("errors_total", 20.0));
        engine.dispatch_pending().await;

        let stats = engine.stats();
        assert_eq!(stats.sent_total, 0);
        assert_eq!(stats.failed_total, 1);
        assert_eq!(engine.channel_failures("ops-webhook"), 1);
    }

    #[tokio::test]
    async fn telegram_channel_dispatch_writes_event_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AlertEngine::new(base_config(), dir.path(), test_time_provider()).unwrap();
        engine.handle_signal(&violation("errors_total", 20.0));
        engine.dispatch_pending().await;

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(engine.stats().sent_total, 1);
    }
}
