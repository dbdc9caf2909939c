//! The standard tool registry
//!
//! Sixteen tools across four groups: event emission, bridge lifecycle,
//! response views, and status queries. Handlers only parse arguments the
//! schema already validated and translate component results into the tool's
//! documented result shape.

use crate::dispatch::{Components, FieldKind, FieldSpec, HandlerFn, ToolSpec};
use crate::domain_types::{EventDescription, EventId, EventTitle, Severity, SourceName, TaskId};
use crate::error::{CoreError, Result};
use crate::events::{EventData, EventDraft, EventType};
use crate::tasks::TaskSystem;
use futures::FutureExt;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;

/// Builds the full registry
pub fn registry() -> Vec<ToolSpec> {
    vec![
        send_event_tool(),
        send_message_tool(),
        send_task_completion_tool(),
        send_performance_alert_tool(),
        send_approval_request_tool(),
        start_bridge_tool(),
        stop_bridge_tool(),
        restart_bridge_tool(),
        ensure_bridge_running_tool(),
        check_bridge_process_tool(),
        get_responses_tool(),
        process_pending_tool(),
        clear_old_responses_tool(),
        get_bridge_status_tool(),
        list_event_types_tool(),
        get_task_status_tool(),
    ]
}

/// Names of every event type, for the `send_event` schema enum
const EVENT_TYPE_NAMES: [&str; 16] = [
    "task_completion",
    "task_started",
    "task_failed",
    "task_progress",
    "task_cancelled",
    "code_generation",
    "build_completed",
    "build_failed",
    "test_suite_run",
    "lint_check",
    "approval_request",
    "performance_alert",
    "error_occurred",
    "system_health",
    "info_notification",
    "progress_update",
];

fn handler<F>(f: F) -> HandlerFn
where
    F: Fn(
            Arc<Components>,
            Value,
            tokio_util::sync::CancellationToken,
        ) -> futures::future::BoxFuture<'static, Result<Value>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

fn str_arg(arguments: &Value, name: &str) -> Option<String> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn u64_arg(arguments: &Value, name: &str) -> Option<u64> {
    arguments.get(name).and_then(Value::as_u64)
}

fn f64_arg(arguments: &Value, name: &str) -> Option<f64> {
    arguments.get(name).and_then(Value::as_f64)
}

fn string_list_arg(arguments: &Value, name: &str) -> Option<Vec<String>> {
    arguments.get(name).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

fn parse_title(value: String) -> Result<EventTitle> {
    EventTitle::try_new(value).map_err(|err| CoreError::Validation {
        field: "title".to_string(),
        reason: err.to_string(),
        constraint: "1..=200 chars".to_string(),
    })
}

fn parse_description(value: String) -> Result<EventDescription> {
    EventDescription::try_new(value).map_err(|err| CoreError::Validation {
        field: "description".to_string(),
        reason: err.to_string(),
        constraint: "<= 4000 chars".to_string(),
    })
}

fn parse_task_id(value: String) -> Result<TaskId> {
    TaskId::try_new(value).map_err(|err| CoreError::Validation {
        field: "task_id".to_string(),
        reason: err.to_string(),
        constraint: "1..=128 chars".to_string(),
    })
}

fn parse_source(value: Option<String>) -> Result<Option<SourceName>> {
    value
        .map(|v| {
            SourceName::try_new(v).map_err(|err| CoreError::Validation {
                field: "source".to_string(),
                reason: err.to_string(),
                constraint: "1..=64 chars".to_string(),
            })
        })
        .transpose()
}

// --- event tools ---------------------------------------------------------

fn send_event_tool() -> ToolSpec {
    ToolSpec {
        name: "send_event",
        capability: "events:write",
        description: "Send a structured event to the user via the delivery bridge",
        fields: vec![
            FieldSpec::required("type", FieldKind::String).one_of(&EVENT_TYPE_NAMES),
            FieldSpec::required("title", FieldKind::String),
            FieldSpec::required("description", FieldKind::String),
            FieldSpec::optional("task_id", FieldKind::String),
            FieldSpec::optional("event_id", FieldKind::String),
            FieldSpec::optional("source", FieldKind::String),
            FieldSpec::optional("data", FieldKind::Object),
        ],
        handler: handler(|components, arguments, cancel| {
            async move {
                let type_name = str_arg(&arguments, "type").unwrap_or_default();
                let event_type =
                    EventType::parse(&type_name).ok_or_else(|| CoreError::Validation {
                        field: "type".to_string(),
                        reason: format!("{type_name} is not a recognized event type"),
                        constraint: "enumerated event type".to_string(),
                    })?;
                let data: EventData = match arguments.get("data") {
                    Some(raw) if !raw.is_null() => {
                        serde_json::from_value(raw.clone()).map_err(|err| {
                            CoreError::Validation {
                                field: "data".to_string(),
                                reason: err.to_string(),
                                constraint: "event data object".to_string(),
                            }
                        })?
                    }
                    _ => EventData::default(),
                };
                let event_id = str_arg(&arguments, "event_id")
                    .map(|id| {
                        EventId::try_new(id).map_err(|err| CoreError::Validation {
                            field: "event_id".to_string(),
                            reason: err.to_string(),
                            constraint: "filename-safe id".to_string(),
                        })
                    })
                    .transpose()?;

                let draft = EventDraft {
                    event_type,
                    title: parse_title(str_arg(&arguments, "title").unwrap_or_default())?,
                    description: parse_description(
                        str_arg(&arguments, "description").unwrap_or_default(),
                    )?,
                    task_id: str_arg(&arguments, "task_id").map(parse_task_id).transpose()?,
                    event_id,
                    source: parse_source(str_arg(&arguments, "source"))?,
                    data,
                };
                let outcome = components.pipeline.send(draft, &cancel).await?;
                Ok(json!({
                    "success": outcome.success,
                    "event_id": outcome.event_id,
                    "file_path": outcome.file_path,
                }))
            }
            .boxed()
        }),
    }
}

fn send_message_tool() -> ToolSpec {
    ToolSpec {
        name: "send_message",
        capability: "events:write",
        description: "Send a free-form informational message to the user",
        fields: vec![
            FieldSpec::required("message", FieldKind::String),
            FieldSpec::optional("source", FieldKind::String),
        ],
        handler: handler(|components, arguments, cancel| {
            async move {
                let message = str_arg(&arguments, "message").unwrap_or_default();
                let draft = EventDraft {
                    event_type: EventType::InfoNotification,
                    title: parse_title("Message from agent".to_string())?,
                    description: parse_description(message)?,
                    task_id: None,
                    event_id: None,
                    source: parse_source(str_arg(&arguments, "source"))?,
                    data: EventData::default(),
                };
                let outcome = components.pipeline.send(draft, &cancel).await?;
                Ok(json!({ "success": outcome.success, "event_id": outcome.event_id }))
            }
            .boxed()
        }),
    }
}

fn send_task_completion_tool() -> ToolSpec {
    ToolSpec {
        name: "send_task_completion",
        capability: "events:write",
        description: "Notify the user that a task finished",
        fields: vec![
            FieldSpec::required("task_id", FieldKind::String),
            FieldSpec::required("title", FieldKind::String),
            FieldSpec::optional("results", FieldKind::String),
            FieldSpec::optional("files_affected", FieldKind::StringArray),
            FieldSpec::optional("duration_ms", FieldKind::Number),
        ],
        handler: handler(|components, arguments, cancel| {
            async move {
                let data = EventData {
                    results: str_arg(&arguments, "results").map(Value::String),
                    files_affected: string_list_arg(&arguments, "files_affected"),
                    duration_ms: u64_arg(&arguments, "duration_ms"),
                    ..EventData::default()
                };
                let draft = EventDraft {
                    event_type: EventType::TaskCompletion,
                    title: parse_title(str_arg(&arguments, "title").unwrap_or_default())?,
                    description: EventDescription::default(),
                    task_id: Some(parse_task_id(
                        str_arg(&arguments, "task_id").unwrap_or_default(),
                    )?),
                    event_id: None,
                    source: None,
                    data,
                };
                let outcome = components.pipeline.send(draft, &cancel).await?;
                Ok(json!({ "success": outcome.success, "event_id": outcome.event_id }))
            }
            .boxed()
        }),
    }
}

fn send_performance_alert_tool() -> ToolSpec {
    ToolSpec {
        name: "send_performance_alert",
        capability: "events:write",
        description: "Alert the user that a measured value crossed its threshold",
        fields: vec![
            FieldSpec::required("title", FieldKind::String),
            FieldSpec::required("current_value", FieldKind::Number),
            FieldSpec::required("threshold", FieldKind::Number),
            FieldSpec::optional("severity", FieldKind::String)
                .one_of(&["low", "medium", "high", "critical"]),
        ],
        handler: handler(|components, arguments, cancel| {
            async move {
                let severity = match str_arg(&arguments, "severity").as_deref() {
                    Some("low") => Severity::Low,
                    Some("high") => Severity::High,
                    Some("critical") => Severity::Critical,
                    _ => Severity::Medium,
                };
                let current_value = f64_arg(&arguments, "current_value").unwrap_or_default();
                let threshold = f64_arg(&arguments, "threshold").unwrap_or_default();
                let data = EventData {
                    severity: Some(severity),
                    current_value: Some(current_value),
                    threshold: Some(threshold),
                    ..EventData::default()
                };
                let draft = EventDraft {
                    event_type: EventType::PerformanceAlert,
                    title: parse_title(str_arg(&arguments, "title").unwrap_or_default())?,
                    description: parse_description(format!(
                        "current value {current_value} crossed threshold {threshold}"
                    ))?,
                    task_id: None,
                    event_id: None,
                    source: None,
                    data,
                };
                let outcome = components.pipeline.send(draft, &cancel).await?;
                Ok(json!({ "success": outcome.success, "event_id": outcome.event_id }))
            }
            .boxed()
        }),
    }
}

fn send_approval_request_tool() -> ToolSpec {
    ToolSpec {
        name: "send_approval_request",
        capability: "events:write",
        description: "Ask the user for a decision with inline response buttons",
        fields: vec![
            FieldSpec::required("title", FieldKind::String),
            FieldSpec::required("description", FieldKind::String),
            FieldSpec::optional("options", FieldKind::StringArray),
        ],
        handler: handler(|components, arguments, cancel| {
            async move {
                let options = string_list_arg(&arguments, "options")
                    .filter(|opts| !opts.is_empty())
                    .unwrap_or_else(|| vec!["Approve".to_string(), "Deny".to_string()]);
                let data = EventData {
                    requires_response: Some(true),
                    response_options: Some(options),
                    ..EventData::default()
                };
                let draft = EventDraft {
                    event_type: EventType::ApprovalRequest,
                    title: parse_title(str_arg(&arguments, "title").unwrap_or_default())?,
                    description: parse_description(
                        str_arg(&arguments, "description").unwrap_or_default(),
                    )?,
                    task_id: None,
                    event_id: None,
                    source: None,
                    data,
                };
                let outcome = components.pipeline.send(draft, &cancel).await?;
                Ok(json!({ "success": outcome.success, "event_id": outcome.event_id }))
            }
            .boxed()
        }),
    }
}

// --- bridge tools --------------------------------------------------------

fn start_bridge_tool() -> ToolSpec {
    ToolSpec {
        name: "start_bridge",
        capability: "bridge:manage",
        description: "Start the delivery bridge process",
        fields: Vec::new(),
        handler: handler(|components, _arguments, cancel| {
            async move {
                let pid = components.bridge.start().await?;
                components.bridge.wait_for_ready(&cancel).await?;
                Ok(json!({
                    "success": true,
                    "message": "bridge started and ready",
                    "pid": pid,
                }))
            }
            .boxed()
        }),
    }
}

fn stop_bridge_tool() -> ToolSpec {
    ToolSpec {
        name: "stop_bridge",
        capability: "bridge:manage",
        description: "Stop the delivery bridge process",
        fields: Vec::new(),
        handler: handler(|components, _arguments, _cancel| {
            async move {
                let terminated = components.bridge.stop().await?;
                Ok(json!({
                    "success": true,
                    "message": format!("terminated {terminated} bridge process(es)"),
                }))
            }
            .boxed()
        }),
    }
}

fn restart_bridge_tool() -> ToolSpec {
    ToolSpec {
        name: "restart_bridge",
        capability: "bridge:manage",
        description: "Restart the delivery bridge process",
        fields: Vec::new(),
        handler: handler(|components, _arguments, cancel| {
            async move {
                let pid = components.bridge.restart(&cancel).await?;
                Ok(json!({
                    "success": true,
                    "message": "bridge restarted",
                    "pid": pid,
                }))
            }
            .boxed()
        }),
    }
}

fn ensure_bridge_running_tool() -> ToolSpec {
    ToolSpec {
        name: "ensure_bridge_running",
        capability: "bridge:manage",
        description: "Start the bridge only if it is not already running",
        fields: Vec::new(),
        handler: handler(|components, _arguments, cancel| {
            async move {
                match components.bridge.ensure_ready(&cancel).await {
                    Ok(outcome) => Ok(json!({
                        "success": true,
                        "action": outcome.as_str(),
                    })),
                    Err(
                        err @ (CoreError::BridgeStartFailed { .. }
                        | CoreError::BridgeNotFound { .. }
                        | CoreError::BridgeMisconfigured { .. }),
                    ) => Ok(json!({
                        "success": false,
                        "action": "failed",
                        "reason": err.to_string(),
                    })),
                    Err(err) => Err(err),
                }
            }
            .boxed()
        }),
    }
}

fn check_bridge_process_tool() -> ToolSpec {
    ToolSpec {
        name: "check_bridge_process",
        capability: "status:read",
        description: "Check for a running bridge process without probing its endpoint",
        fields: Vec::new(),
        handler: handler(|components, _arguments, _cancel| {
            async move {
                let pid = components.bridge.find_pid();
                Ok(json!({ "running": pid.is_some(), "pid": pid }))
            }
            .boxed()
        }),
    }
}

// --- response tools ------------------------------------------------------

fn get_responses_tool() -> ToolSpec {
    ToolSpec {
        name: "get_responses",
        capability: "responses:read",
        description: "List recent user responses, newest first",
        fields: vec![FieldSpec::optional("limit", FieldKind::Number)],
        handler: handler(|components, arguments, _cancel| {
            async move {
                let limit = u64_arg(&arguments, "limit").unwrap_or(10) as usize;
                let view = components.responses.list(limit).await?;
                Ok(serde_json::to_value(view)?)
            }
            .boxed()
        }),
    }
}

fn process_pending_tool() -> ToolSpec {
    ToolSpec {
        name: "process_pending",
        capability: "responses:read",
        description: "Extract actionable approvals and denials from recent responses",
        fields: vec![FieldSpec::optional("since_minutes", FieldKind::Number)],
        handler: handler(|components, arguments, _cancel| {
            async move {
                let since_minutes = u64_arg(&arguments, "since_minutes").unwrap_or(10);
                let view = components.responses.process_pending(since_minutes).await?;
                Ok(serde_json::to_value(view)?)
            }
            .boxed()
        }),
    }
}

fn clear_old_responses_tool() -> ToolSpec {
    ToolSpec {
        name: "clear_old_responses",
        capability: "responses:write",
        description: "Delete response records older than the given age",
        fields: vec![FieldSpec::optional("older_than_hours", FieldKind::Number)],
        handler: handler(|components, arguments, _cancel| {
            async move {
                let hours = u64_arg(&arguments, "older_than_hours").unwrap_or(24);
                let deleted = components.responses.clear_older_than(hours).await?;
                Ok(json!({ "deleted_count": deleted }))
            }
            .boxed()
        }),
    }
}

// --- status tools --------------------------------------------------------

fn get_bridge_status_tool() -> ToolSpec {
    ToolSpec {
        name: "get_bridge_status",
        capability: "status:read",
        description: "Full bridge status: health, counters, process gauges",
        fields: Vec::new(),
        handler: handler(|components, _arguments, cancel| {
            async move {
                let status = components.bridge.status(&cancel).await;
                Ok(serde_json::to_value(status)?)
            }
            .boxed()
        }),
    }
}

fn list_event_types_tool() -> ToolSpec {
    ToolSpec {
        name: "list_event_types",
        capability: "status:read",
        description: "Enumerate the event types the bridge can deliver",
        fields: Vec::new(),
        handler: handler(|_components, _arguments, _cancel| {
            async move {
                let types: Vec<Value> = EventType::ALL
                    .iter()
                    .map(|t| json!({ "name": t.as_str(), "description": t.description() }))
                    .collect();
                Ok(json!({ "event_types": types, "count": types.len() }))
            }
            .boxed()
        }),
    }
}

fn get_task_status_tool() -> ToolSpec {
    ToolSpec {
        name: "get_task_status",
        capability: "status:read",
        description: "Aggregate task status from the configured trackers",
        fields: vec![
            FieldSpec::optional("project_root", FieldKind::String),
            FieldSpec::optional("task_system", FieldKind::String)
                .one_of(&["claude-code", "taskmaster", "both"]),
            FieldSpec::optional("status_filter", FieldKind::String)
                .one_of(&["pending", "in_progress", "completed", "blocked"]),
            FieldSpec::optional("summary_only", FieldKind::Bool),
        ],
        handler: handler(|components, arguments, _cancel| {
            async move {
                let project_root = str_arg(&arguments, "project_root")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                let system = TaskSystem::parse(str_arg(&arguments, "task_system").as_deref());
                let status_filter = str_arg(&arguments, "status_filter");
                let summary_only = arguments
                    .get("summary_only")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let report = components
                    .tasks
                    .status(
                        &project_root,
                        system,
                        status_filter.as_deref(),
                        summary_only,
                    )
                    .await?;
                Ok(serde_json::to_value(report)?)
            }
            .boxed()
        }),
    }
}
