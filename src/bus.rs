//! Internal signal bus
//!
//! Components that would otherwise form cycles (metrics → alerting → logger
//! → metrics) publish signals here instead of calling each other. Emitters
//! hold only a [`SignalPublisher`]; subscribers register at init.

use crate::domain_types::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Capacity of the broadcast ring; laggy subscribers drop oldest signals
const BUS_CAPACITY: usize = 1024;

/// Cross-component signals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    /// A metric crossed a configured threshold for its full duration
    ThresholdViolation {
        metric: String,
        current_value: f64,
        threshold: f64,
        severity: Severity,
        labels: HashMap<String, String>,
        at: DateTime<Utc>,
    },
    /// The security monitor recorded a finding
    SecurityEvent {
        rule: String,
        source_ip: Option<String>,
        client_id: Option<String>,
        severity: Severity,
        detail: String,
        at: DateTime<Utc>,
    },
    /// A health-checked endpoint changed state
    HealthTransition {
        endpoint: String,
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    /// The buffer pool crossed its memory-pressure ceiling
    MemoryPressure {
        resident_mb: u64,
        limit_mb: u64,
        at: DateTime<Utc>,
    },
    /// The logger saw a message pattern repeat past its threshold
    LogAggregation {
        pattern: String,
        count: u64,
        window_secs: u64,
        at: DateTime<Utc>,
    },
    /// An operation blew through its SLA budget
    SlaViolation {
        operation: String,
        duration_ms: u64,
        budget_ms: u64,
        at: DateTime<Utc>,
    },
}

impl Signal {
    /// Severity for alert routing; signals without an inherent one map
    /// to a fixed default
    pub fn severity(&self) -> Severity {
        match self {
            Signal::ThresholdViolation { severity, .. }
            | Signal::SecurityEvent { severity, .. } => *severity,
            Signal::HealthTransition { to, .. } => {
                if to == "unhealthy" {
                    Severity::High
                } else {
                    Severity::Medium
                }
            }
            Signal::MemoryPressure { .. } => Severity::High,
            Signal::LogAggregation { .. } => Severity::Low,
            Signal::SlaViolation { .. } => Severity::Medium,
        }
    }
}

/// Publish half of the bus; cheap to clone into any component
#[derive(Debug, Clone)]
pub struct SignalPublisher {
    sender: broadcast::Sender<Signal>,
}

impl SignalPublisher {
    /// Publishes a signal; silently dropped when nobody subscribes
    pub fn publish(&self, signal: Signal) {
        let _ = self.sender.send(signal);
    }
}

/// The bus itself; owned by the composition root
#[derive(Debug)]
pub struct SignalBus {
    sender: broadcast::Sender<Signal>,
}

impl SignalBus {
    /// Creates a bus with the default ring capacity
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Hands out a publisher handle
    pub fn publisher(&self) -> SignalPublisher {
        SignalPublisher {
            sender: self.sender.clone(),
        }
    }

    /// Registers a subscriber; each gets every signal published after
    /// the call
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.sender.subscribe()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_signals_reach_subscribers() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();
        let publisher = bus.publisher();

        publisher.publish(Signal::MemoryPressure {
            resident_mb: 600,
            limit_mb: 512,
            at: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            Signal::MemoryPressure { resident_mb, .. } => assert_eq!(resident_mb, 600),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = SignalBus::new();
        bus.publisher().publish(Signal::LogAggregation {
            pattern: "retry N of N".to_string(),
            count: 12,
            window_secs: 60,
            at: Utc::now(),
        });
    }

    #[test]
    fn health_transition_to_unhealthy_is_high_severity() {
        let signal = Signal::HealthTransition {
            endpoint: "bridge".to_string(),
            from: "degraded".to_string(),
            to: "unhealthy".to_string(),
            at: Utc::now(),
        };
        assert_eq!(signal.severity(), Severity::High);
    }
}
