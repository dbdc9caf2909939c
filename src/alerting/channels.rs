//! Alert delivery channels
//!
//! Tagged variants with one `send` contract. Slack, PagerDuty, and generic
//! webhooks POST JSON; the Telegram channel drops an alert event into the
//! events drop-zone so the external bridge delivers it like any other
//! notification; email renders into the operator log (no MTA is configured
//! in this deployment).

use crate::alerting::Alert;
use crate::config::AlertChannelConfig;
use crate::domain_types::Severity;
use crate::error::{CoreError, Result};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

/// One configured delivery channel
#[derive(Debug, Clone)]
pub enum AlertChannel {
    Telegram { name: String, events_dir: PathBuf, severities: Vec<Severity> },
    Email { name: String, recipient: String, severities: Vec<Severity> },
    Slack { name: String, webhook_url: String, severities: Vec<Severity> },
    Webhook { name: String, url: String, severities: Vec<Severity> },
    Pagerduty { name: String, routing_key: String, severities: Vec<Severity> },
}

impl AlertChannel {
    /// Builds a channel from its declarative config
    pub fn from_config(config: &AlertChannelConfig, events_dir: &std::path::Path) -> Result<Self> {
        let severities = if config.severities.is_empty() {
            Severity::ALL.to_vec()
        } else {
            config.severities.clone()
        };
        let name = config.name.clone();
        match config.kind.as_str() {
            "telegram" => Ok(Self::Telegram {
                name,
                events_dir: events_dir.to_path_buf(),
                severities,
            }),
            "email" => Ok(Self::Email {
                name,
                recipient: config.target.clone(),
                severities,
            }),
            "slack" => Ok(Self::Slack {
                name,
                webhook_url: config.target.clone(),
                severities,
            }),
            "webhook" => Ok(Self::Webhook {
                name,
                url: config.target.clone(),
                severities,
            }),
            "pagerduty" => Ok(Self::Pagerduty {
                name,
                routing_key: config.target.clone(),
                severities,
            }),
            other => Err(CoreError::Validation {
                field: "alerting.channels.kind".to_string(),
                reason: format!("unknown channel kind: {other}"),
                constraint: "telegram | email | slack | webhook | pagerduty".to_string(),
            }),
        }
    }

    /// Channel name used in rule and escalation references
    pub fn name(&self) -> &str {
        match self {
            Self::Telegram { name, .. }
            | Self::Email { name, .. }
            | Self::Slack { name, .. }
            | Self::Webhook { name, .. }
            | Self::Pagerduty { name, .. } => name,
        }
    }

    /// Whether this channel accepts the given severity
    pub fn accepts(&self, severity: Severity) -> bool {
        let severities = match self {
            Self::Telegram { severities, .. }
            | Self::Email { severities, .. }
            | Self::Slack { severities, .. }
            | Self::Webhook { severities, .. }
            | Self::Pagerduty { severities, .. } => severities,
        };
        severities.contains(&severity)
    }

    /// Sends one alert through this channel (single attempt; the engine
    /// owns the retry ladder)
    pub async fn send(&self, alert: &Alert, http: &reqwest::Client) -> Result<()> {
        match self {
            Self::Telegram { events_dir, .. } => {
                let payload = serde_json::to_vec_pretty(&json!({
                    "event_id": format!("alert-{}", alert.id),
                    "task_id": format!("alert-{}", alert.id),
                    "type": "performance_alert",
                    "source": "alerting",
                    "timestamp": alert.updated_at.to_rfc3339(),
                    "title": alert.title,
                    "description": alert.description,
                    "data": {
                        "severity": alert.severity.as_str(),
                        "current_value": alert.current_value,
                        "threshold": alert.threshold_value,
                    }
                }))?;
                let filename = format!(
                    "alert-{}_{}.json",
                    alert.id,
                    alert.updated_at.timestamp_millis()
                );
                tokio::fs::create_dir_all(events_dir).await?;
                tokio::fs::write(events_dir.join(filename), payload).await?;
                Ok(())
            }
            Self::Email { recipient, .. } => {
                info!(
                    recipient = %recipient,
                    alert = %alert.id,
                    severity = %alert.severity,
                    title = %alert.title,
                    "email channel rendered alert"
                );
                Ok(())
            }
            Self::Slack { webhook_url, .. } => {
                let body = json!({
                    "text": format!("[{}] {}: {}", alert.severity, alert.title, alert.description),
                });
                post_json(http, webhook_url, &body).await
            }
            Self::Webhook { url, .. } => {
                let body = serde_json::to_value(alert)?;
                post_json(http, url, &body).await
            }
            Self::Pagerduty { routing_key, .. } => {
                let body = json!({
                    "routing_key": routing_key,
                    "event_action": "trigger",
                    "dedup_key": alert.fingerprint,
                    "payload": {
                        "summary": alert.title,
                        "severity": pagerduty_severity(alert.severity),
                        "source": "telebridge",
                        "custom_details": {
                            "metric": alert.metric,
                            "current_value": alert.current_value,
                            "threshold": alert.threshold_value,
                        }
                    }
                });
                post_json(http, "https://events.pagerduty.com/v2/enqueue", &body).await
            }
        }
    }
}

async fn post_json(http: &reqwest::Client, url: &str, body: &serde_json::Value) -> Result<()> {
    let response = http.post(url).json(body).send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(CoreError::Network {
            operation: url.to_string(),
            detail: format!("channel endpoint returned {status}"),
        })
    }
}

fn pagerduty_severity(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "info",
        Severity::Medium => "warning",
        Severity::High => "error",
        Severity::Critical => "critical",
    }
}
