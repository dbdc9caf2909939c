//! Request security monitor
//!
//! Every tool invocation is inspected before dispatch: pattern and injection
//! detection over the tool name and serialized arguments, source-IP
//! blocklist membership, and a per-client behavioral baseline. Findings run
//! through the mitigation ladder; `block` extends the blocklist, and every
//! event is published for the alerting engine.

use crate::bus::{Signal, SignalPublisher};
use crate::config::SecurityConfig;
use crate::domain_types::{Confidence, Severity};
use crate::error::{CoreError, Result};
use crate::time_provider::SharedTimeProvider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Classification of a threat indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorType {
    Ip,
    Hash,
    Domain,
    Pattern,
    Behavior,
}

/// Accumulated evidence about one recurring threat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatIndicator {
    pub indicator_type: IndicatorType,
    pub value: String,
    pub confidence: Confidence,
    pub source: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
}

/// One security finding on a request
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub rule: String,
    pub severity: Severity,
    pub detail: String,
    pub source_ip: Option<String>,
    pub client_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Verdict over one inspected request
#[derive(Debug, Clone, Serialize)]
pub struct SecurityVerdict {
    pub threat: bool,
    /// Set when the mitigation ladder chose block or quarantine
    pub blocked: bool,
    /// Rule that triggered the block, when blocked
    pub blocking_rule: Option<String>,
    pub events: Vec<SecurityEvent>,
}

impl SecurityVerdict {
    fn clean() -> Self {
        Self {
            threat: false,
            blocked: false,
            blocking_rule: None,
            events: Vec::new(),
        }
    }
}

/// Mitigation action chosen by the escalation ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MitigationAction {
    Log,
    Alert,
    Block,
    Quarantine,
    Escalate,
}

/// One rung of the mitigation ladder: first matching condition wins
#[derive(Debug, Clone)]
pub struct MitigationRule {
    pub min_severity: Severity,
    pub action: MitigationAction,
}

/// Request fields the monitor inspects
#[derive(Debug, Clone, Copy)]
pub struct InspectRequest<'a> {
    pub tool: &'a str,
    pub body: &'a str,
    pub source_ip: Option<&'a str>,
    pub client_id: Option<&'a str>,
}

struct DetectionRule {
    name: &'static str,
    severity: Severity,
    regex: regex::Regex,
}

/// Per-request security monitor
pub struct SecurityMonitor {
    rules: Vec<DetectionRule>,
    ladder: Vec<MitigationRule>,
    /// ip -> blocklist expiry
    blocklist: DashMap<String, DateTime<Utc>>,
    /// (client, epoch-hour) -> request count
    baseline: DashMap<(String, u64), u64>,
    indicators: DashMap<(IndicatorType, String), ThreatIndicator>,
    publisher: SignalPublisher,
    config: SecurityConfig,
    time: SharedTimeProvider,
}

/// Built-in injection shapes, matched case-insensitively
const INJECTION_RULES: [(&str, Severity, &str); 4] = [
    (
        "sql_injection",
        Severity::High,
        r"\b(union\s+select|select\s+[\w\s,*]+\s+from|insert\s+into|drop\s+table|delete\s+from|or\s+1\s*=\s*1)\b",
    ),
    ("script_injection", Severity::High, r"<\s*script[^>]*>"),
    ("path_traversal", Severity::High, r"\.\./|\.\.\\|%2e%2e"),
    (
        "shell_injection",
        Severity::Critical,
        r"[;&|]\s*(rm|curl|wget|nc|bash|sh|python)\b|\$\((?s).*\)|`(?s).*`",
    ),
];

impl SecurityMonitor {
    /// Builds the monitor from built-in rules plus configured patterns
    pub fn new(
        config: SecurityConfig,
        publisher: SignalPublisher,
        time: SharedTimeProvider,
    ) -> Result<Self> {
        let mut rules = Vec::new();
        for (name, severity, pattern) in INJECTION_RULES {
            rules.push(DetectionRule {
                name,
                severity,
                regex: compile_ci(pattern)?,
            });
        }
        for pattern in &config.suspicious_patterns {
            rules.push(DetectionRule {
                name: "suspicious_pattern",
                severity: Severity::High,
                regex: compile_ci(pattern)?,
            });
        }

        Ok(Self {
            rules,
            ladder: default_ladder(),
            blocklist: DashMap::new(),
            baseline: DashMap::new(),
            indicators: DashMap::new(),
            publisher,
            config,
            time,
        })
    }

    /// Replaces the mitigation ladder (first matching rung wins)
    pub fn set_ladder(&mut self, ladder: Vec<MitigationRule>) {
        self.ladder = ladder;
    }

    /// Inspects one request and applies mitigations
    pub fn inspect(&self, request: InspectRequest<'_>) -> SecurityVerdict {
        let now = self.time.now_utc();
        let mut verdict = SecurityVerdict::clean();

        if let Some(ip) = request.source_ip {
            if self.is_blocklisted(ip, now) {
                verdict.events.push(SecurityEvent {
                    rule: "blocklisted_ip".to_string(),
                    severity: Severity::Critical,
                    detail: format!("request from blocklisted ip {ip}"),
                    source_ip: Some(ip.to_string()),
                    client_id: request.client_id.map(str::to_string),
                    at: now,
                });
            }
        }

        for rule in &self.rules {
            let hit_in = if rule.regex.is_match(request.tool) {
                Some("tool")
            } else if rule.regex.is_match(request.body) {
                Some("arguments")
            } else {
                None
            };
            if let Some(location) = hit_in {
                verdict.events.push(SecurityEvent {
                    rule: rule.name.to_string(),
                    severity: rule.severity,
                    detail: format!("pattern matched in {location}"),
                    source_ip: request.source_ip.map(str::to_string),
                    client_id: request.client_id.map(str::to_string),
                    at: now,
                });
                self.observe_indicator(IndicatorType::Pattern, rule.name, "monitor", now);
            }
        }

        if let Some(anomaly) = self.record_and_check_baseline(request.client_id, now) {
            verdict.events.push(anomaly);
        }

        if verdict.events.is_empty() {
            return verdict;
        }
        verdict.threat = true;

        let worst = verdict
            .events
            .iter()
            .max_by_key(|e| e.severity)
            .map(|e| (e.rule.clone(), e.severity))
            .unwrap_or(("unknown".to_string(), Severity::Low));

        let action = self
            .ladder
            .iter()
            .find(|rung| worst.1 >= rung.min_severity)
            .map_or(MitigationAction::Log, |rung| rung.action);

        match action {
            MitigationAction::Block | MitigationAction::Quarantine => {
                verdict.blocked = true;
                verdict.blocking_rule = Some(worst.0.clone());
                if let Some(ip) = request.source_ip {
                    self.block_ip(ip, now);
                }
            }
            MitigationAction::Alert | MitigationAction::Escalate => {
                debug!(rule = %worst.0, "security finding escalated to alerting");
            }
            MitigationAction::Log => {}
        }

        for event in &verdict.events {
            self.publisher.publish(Signal::SecurityEvent {
                rule: event.rule.clone(),
                source_ip: event.source_ip.clone(),
                client_id: event.client_id.clone(),
                severity: event.severity,
                detail: event.detail.clone(),
                at: event.at,
            });
        }

        if verdict.blocked {
            warn!(rule = %worst.0, severity = %worst.1, "request blocked by security monitor");
        }
        verdict
    }

    /// Adds an IP to the blocklist for the configured duration
    pub fn block_ip(&self, ip: &str, now: DateTime<Utc>) {
        let expires = now
            + chrono::Duration::from_std(Duration::from_secs(self.config.block_duration_secs))
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        self.blocklist.insert(ip.to_string(), expires);
        self.observe_indicator(IndicatorType::Ip, ip, "mitigation", now);
    }

    /// Whether an IP is currently blocklisted; expired entries are pruned
    pub fn is_blocklisted(&self, ip: &str, now: DateTime<Utc>) -> bool {
        // read the guard and release it before touching the shard again
        let active = self.blocklist.get(ip).map(|expiry| *expiry > now);
        match active {
            Some(true) => true,
            Some(false) => {
                self.blocklist.remove(ip);
                false
            }
            None => false,
        }
    }

    /// Current threat indicators, for the status surface
    pub fn indicators(&self) -> Vec<ThreatIndicator> {
        self.indicators.iter().map(|e| e.value().clone()).collect()
    }

    fn observe_indicator(
        &self,
        indicator_type: IndicatorType,
        value: &str,
        source: &str,
        now: DateTime<Utc>,
    ) {
        self.indicators
            .entry((indicator_type, value.to_string()))
            .and_modify(|indicator| {
                indicator.confidence = indicator.confidence.observe();
                indicator.last_seen = now;
                indicator.count += 1;
            })
            .or_insert_with(|| ThreatIndicator {
                indicator_type,
                value: value.to_string(),
                confidence: Confidence::try_new(50).unwrap_or_default(),
                source: source.to_string(),
                first_seen: now,
                last_seen: now,
                count: 1,
            });
    }

    /// Records the request in the hourly histogram and reports an anomaly
    /// when the current hour runs hotter than 2x the client's average
    fn record_and_check_baseline(
        &self,
        client_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<SecurityEvent> {
        let client = client_id?;
        let hour = u64::try_from(now.timestamp()).ok()? / 3600;
        let retention = u64::from(self.config.baseline_retention_hours);

        let current = {
            let mut entry = self
                .baseline
                .entry((client.to_string(), hour))
                .or_insert(0);
            *entry += 1;
            *entry
        };
        self.baseline
            .retain(|(_, bucket_hour), _| hour.saturating_sub(*bucket_hour) < retention);

        let (sum, buckets) = self
            .baseline
            .iter()
            .filter(|entry| entry.key().0 == client && entry.key().1 != hour)
            .fold((0u64, 0u64), |(sum, n), entry| (sum + *entry.value(), n + 1));
        if buckets == 0 {
            return None;
        }
        let average = sum as f64 / buckets as f64;
        let deviation = current as f64 / average.max(1.0);
        // ignore low-volume noise
        if deviation <= 2.0 || current < 10 {
            return None;
        }

        let confidence = (50.0 + ((deviation - 2.0) / 2.0) * 50.0).min(100.0) as u8;
        self.observe_indicator(IndicatorType::Behavior, client, "baseline", now);
        Some(SecurityEvent {
            rule: "behavioral_anomaly".to_string(),
            severity: Severity::Medium,
            detail: format!(
                "client {client} at {deviation:.1}x hourly average (confidence {confidence})"
            ),
            source_ip: None,
            client_id: Some(client.to_string()),
            at: now,
        })
    }
}

fn compile_ci(pattern: &str) -> Result<regex::Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| CoreError::Validation {
            field: "security.pattern".to_string(),
            reason: err.to_string(),
            constraint: "valid regex".to_string(),
        })
}

/// Default ladder: critical and high findings block, medium alerts, low logs
fn default_ladder() -> Vec<MitigationRule> {
    vec![
        MitigationRule {
            min_severity: Severity::High,
            action: MitigationAction::Block,
        },
        MitigationRule {
            min_severity: Severity::Medium,
            action: MitigationAction::Alert,
        },
        MitigationRule {
            min_severity: Severity::Low,
            action: MitigationAction::Log,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SignalBus;
    use crate::time_provider::test_time_provider;

    fn monitor() -> SecurityMonitor {
        let bus = SignalBus::new();
        SecurityMonitor::new(
            SecurityConfig::default(),
            bus.publisher(),
            test_time_provider(),
        )
        .unwrap()
    }

    fn request<'a>(body: &'a str, ip: Option<&'a str>) -> InspectRequest<'a> {
        InspectRequest {
            tool: "send_message",
            body,
            source_ip: ip,
            client_id: Some("client-1"),
        }
    }

    #[test]
    fn clean_request_passes() {
        let verdict = monitor().inspect(request(r#"{"message":"build finished"}"#, None));
        assert!(!verdict.threat);
        assert!(!verdict.blocked);
    }

    #[test]
    fn script_tag_blocks_and_blocklists_source() {
        let m = monitor();
        let verdict = m.inspect(request(
            r#"{"message":"<script>alert(1)</script>"}"#,
            Some("10.0.0.7"),
        ));
        assert!(verdict.threat);
        assert!(verdict.blocked);
        assert_eq!(verdict.blocking_rule.as_deref(), Some("script_injection"));
        assert!(m.is_blocklisted("10.0.0.7", Utc::now()));
    }

    #[test]
    fn sql_keywords_are_detected() {
        let verdict = monitor().inspect(request(r#"{"q":"1 UNION SELECT password"}"#, None));
        assert!(verdict.events.iter().any(|e| e.rule == "sql_injection"));
    }

    #[test]
    fn path_traversal_is_detected() {
        let verdict = monitor().inspect(request(r#"{"file":"../../etc/passwd"}"#, None));
        assert!(verdict.events.iter().any(|e| e.rule == "path_traversal"));
    }

    #[test]
    fn blocklisted_ip_is_reported_without_new_match() {
        let m = monitor();
        m.block_ip("10.9.9.9", Utc::now());
        let verdict = m.inspect(request(r#"{"message":"hello"}"#, Some("10.9.9.9")));
        assert!(verdict.threat);
        assert!(verdict.events.iter().any(|e| e.rule == "blocklisted_ip"));
    }

    #[test]
    fn indicator_confidence_grows_with_recurrence() {
        let m = monitor();
        for _ in 0..3 {
            let _ = m.inspect(request(r#"{"message":"<script>x</script>"}"#, None));
        }
        let indicators = m.indicators();
        let pattern = indicators
            .iter()
            .find(|i| i.value == "script_injection")
            .unwrap();
        assert_eq!(pattern.count, 3);
        assert_eq!(pattern.confidence.into_inner(), 60);
    }

    #[test]
    fn configured_pattern_is_honored() {
        let bus = SignalBus::new();
        let config = SecurityConfig {
            suspicious_patterns: vec!["forbidden_word".to_string()],
            ..SecurityConfig::default()
        };
        let m = SecurityMonitor::new(config, bus.publisher(), test_time_provider()).unwrap();
        let verdict = m.inspect(request(r#"{"message":"FORBIDDEN_WORD inside"}"#, None));
        assert!(verdict.blocked);
    }
}
