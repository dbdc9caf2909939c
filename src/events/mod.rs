//! Outbound event model
//!
//! An event is the unit of notification handed to the external delivery
//! bridge through the events drop-zone. The wire shape is JSON with stable
//! field order and both `event_id` and `task_id` always present, which older
//! bridge builds require.

pub mod pipeline;

pub use pipeline::{EventDraft, EventPipeline, SendOutcome};

use crate::domain_types::{EventDescription, EventId, EventTitle, Severity, SourceName, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Enumerated event types the bridge knows how to render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCompletion,
    TaskStarted,
    TaskFailed,
    TaskProgress,
    TaskCancelled,
    CodeGeneration,
    BuildCompleted,
    BuildFailed,
    TestSuiteRun,
    LintCheck,
    ApprovalRequest,
    PerformanceAlert,
    ErrorOccurred,
    SystemHealth,
    InfoNotification,
    ProgressUpdate,
}

impl EventType {
    /// Every recognized type, in rendering-priority order
    pub const ALL: [EventType; 16] = [
        EventType::TaskCompletion,
        EventType::TaskStarted,
        EventType::TaskFailed,
        EventType::TaskProgress,
        EventType::TaskCancelled,
        EventType::CodeGeneration,
        EventType::BuildCompleted,
        EventType::BuildFailed,
        EventType::TestSuiteRun,
        EventType::LintCheck,
        EventType::ApprovalRequest,
        EventType::PerformanceAlert,
        EventType::ErrorOccurred,
        EventType::SystemHealth,
        EventType::InfoNotification,
        EventType::ProgressUpdate,
    ];

    /// Canonical snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCompletion => "task_completion",
            EventType::TaskStarted => "task_started",
            EventType::TaskFailed => "task_failed",
            EventType::TaskProgress => "task_progress",
            EventType::TaskCancelled => "task_cancelled",
            EventType::CodeGeneration => "code_generation",
            EventType::BuildCompleted => "build_completed",
            EventType::BuildFailed => "build_failed",
            EventType::TestSuiteRun => "test_suite_run",
            EventType::LintCheck => "lint_check",
            EventType::ApprovalRequest => "approval_request",
            EventType::PerformanceAlert => "performance_alert",
            EventType::ErrorOccurred => "error_occurred",
            EventType::SystemHealth => "system_health",
            EventType::InfoNotification => "info_notification",
            EventType::ProgressUpdate => "progress_update",
        }
    }

    /// Parses the canonical name
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == value)
    }

    /// Short human description, shown by `list_event_types`
    pub fn description(&self) -> &'static str {
        match self {
            EventType::TaskCompletion => "A tracked task finished successfully",
            EventType::TaskStarted => "A tracked task began executing",
            EventType::TaskFailed => "A tracked task failed",
            EventType::TaskProgress => "Progress update for a long-running task",
            EventType::TaskCancelled => "A tracked task was cancelled",
            EventType::CodeGeneration => "Code was generated or modified",
            EventType::BuildCompleted => "A build finished successfully",
            EventType::BuildFailed => "A build failed",
            EventType::TestSuiteRun => "A test suite was executed",
            EventType::LintCheck => "A lint pass was executed",
            EventType::ApprovalRequest => "A decision is needed from the user",
            EventType::PerformanceAlert => "A measured value crossed its threshold",
            EventType::ErrorOccurred => "An unexpected error was reported",
            EventType::SystemHealth => "System health changed",
            EventType::InfoNotification => "Free-form informational message",
            EventType::ProgressUpdate => "Generic progress notification",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form payload with reserved, typed fields
///
/// Unknown keys round-trip through `extra` so producers can attach
/// arbitrary context without a schema change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_affected: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_response: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// In-memory record of event ids this process has committed
///
/// The response views use it to mark which responses correlate to an event
/// we sent. Purely advisory: an unknown id still surfaces the response.
#[derive(Debug, Default)]
pub struct EventLedger {
    sent: dashmap::DashMap<String, DateTime<Utc>>,
}

impl EventLedger {
    /// Creates an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a committed outbound event
    pub fn record(&self, event_id: &str, at: DateTime<Utc>) {
        self.sent.insert(event_id.to_string(), at);
    }

    /// Whether this process committed the given event id
    pub fn contains(&self, event_id: &str) -> bool {
        self.sent.contains_key(event_id)
    }
}

/// One outbound event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: SourceName,
    pub timestamp: DateTime<Utc>,
    pub title: EventTitle,
    pub description: EventDescription,
    #[serde(default)]
    pub data: EventData,
}
