//! Response ingestion and correlation
//!
//! The external bridge drops one JSON file per user response into the
//! responses directory. The core never subscribes to filesystem events;
//! every view is an on-demand poll. Malformed records are counted and
//! skipped, never fatal, because the bridge may be mid-write or an older
//! build may use a different shape.

use crate::error::{CoreError, Result};
use crate::events::EventLedger;
use crate::fs_optimizer::FsOptimizer;
use crate::time_provider::SharedTimeProvider;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Kind of user response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Text,
    CallbackQuery,
    Inline,
}

/// One response record as written by the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One entry of the list view
#[derive(Debug, Clone, Serialize)]
pub struct ResponseView {
    #[serde(flatten)]
    pub record: ResponseRecord,
    /// Set when `event_id` matches an event this process sent
    pub correlated: bool,
}

/// `get_responses` result
#[derive(Debug, Clone, Serialize)]
pub struct ListView {
    pub count: usize,
    pub total: usize,
    pub skipped: usize,
    pub responses: Vec<ResponseView>,
}

/// Approval or denial extracted from callback data
#[derive(Debug, Clone, Serialize)]
pub struct ActionableResponse {
    pub action: String,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub correlated: bool,
    pub raw: ResponseRecord,
}

/// `process_pending` summary
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub total: usize,
    pub actionable: usize,
    pub approvals: usize,
    pub denials: usize,
    pub window_minutes: u64,
}

/// `process_pending` result
#[derive(Debug, Clone, Serialize)]
pub struct PendingView {
    pub summary: PendingSummary,
    pub actionable: Vec<ActionableResponse>,
    pub recommendations: Vec<String>,
}

/// Poll-based views over the responses drop-zone
pub struct ResponseEngine {
    responses_dir: PathBuf,
    fs: FsOptimizer,
    ledger: Arc<EventLedger>,
    action_pattern: Regex,
    time: SharedTimeProvider,
}

impl ResponseEngine {
    /// Creates an engine over `responses_dir`
    pub fn new(
        responses_dir: PathBuf,
        ledger: Arc<EventLedger>,
        time: SharedTimeProvider,
    ) -> Result<Self> {
        Ok(Self {
            responses_dir,
            fs: FsOptimizer::new(),
            ledger,
            action_pattern: Regex::new(r"^(approve|deny)_(.+)$").map_err(|err| {
                CoreError::Internal {
                    message: format!("action pattern failed to compile: {err}"),
                }
            })?,
            time,
        })
    }

    /// Newest-first listing, truncated to `limit`
    pub async fn list(&self, limit: usize) -> Result<ListView> {
        let files = self.fs.list_json_files(&self.responses_dir).await?;
        let total = files.len();
        let (contents, mut skipped) = self.fs.read_batch(&files).await;

        let mut records: Vec<ResponseView> = Vec::new();
        for (path, content) in contents {
            match serde_json::from_str::<ResponseRecord>(&content) {
                Ok(record) => {
                    let correlated = record
                        .event_id
                        .as_deref()
                        .is_some_and(|id| self.ledger.contains(id));
                    records.push(ResponseView { record, correlated });
                }
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping malformed response");
                    skipped += 1;
                }
            }
        }

        records.sort_by(|a, b| b.record.timestamp.cmp(&a.record.timestamp));
        records.truncate(limit);
        Ok(ListView {
            count: records.len(),
            total,
            skipped,
            responses: records,
        })
    }

    /// Actionable approvals/denials whose files changed within the window
    pub async fn process_pending(&self, since_minutes: u64) -> Result<PendingView> {
        let files = self.fs.list_json_files(&self.responses_dir).await?;
        let metas = self.fs.stat_batch(&files).await;
        let window = Duration::from_secs(since_minutes * 60);
        let now = self.time.now();

        let fresh: Vec<PathBuf> = metas
            .iter()
            .filter(|meta| meta.modified_within(window, now))
            .map(|meta| meta.path.clone())
            .collect();
        let total = fresh.len();
        let (contents, _skipped) = self.fs.read_batch(&fresh).await;

        let mut actionable = Vec::new();
        for (_, content) in contents {
            let Ok(record) = serde_json::from_str::<ResponseRecord>(&content) else {
                continue;
            };
            if record.response_type != ResponseType::CallbackQuery {
                continue;
            }
            let Some(callback) = record.callback_data.as_deref() else {
                continue;
            };
            let Some(captures) = self.action_pattern.captures(callback) else {
                continue;
            };
            let action = captures[1].to_string();
            let task_id = captures[2].to_string();
            let correlated = record
                .event_id
                .as_deref()
                .map(|id| self.ledger.contains(id))
                .unwrap_or_else(|| self.ledger.contains(&task_id));
            actionable.push(ActionableResponse {
                action,
                task_id,
                user_id: record.user_id.clone(),
                username: record.username.clone(),
                timestamp: record.timestamp,
                correlated,
                raw: record,
            });
        }

        actionable.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let approvals = actionable.iter().filter(|a| a.action == "approve").count();
        let denials = actionable.iter().filter(|a| a.action == "deny").count();

        let recommendations = actionable
            .iter()
            .map(|entry| {
                let user = entry.username.as_deref().unwrap_or("user");
                match entry.action.as_str() {
                    "approve" => format!("Proceed with task {}: approved by {user}", entry.task_id),
                    _ => format!("Halt task {}: denied by {user}", entry.task_id),
                }
            })
            .collect();

        Ok(PendingView {
            summary: PendingSummary {
                total,
                actionable: actionable.len(),
                approvals,
                denials,
                window_minutes: since_minutes,
            },
            actionable,
            recommendations,
        })
    }

    /// Deletes records older than `hours`; per-file errors never abort
    pub async fn clear_older_than(&self, hours: u64) -> Result<usize> {
        let files = self.fs.list_json_files(&self.responses_dir).await?;
        let metas = self.fs.stat_batch(&files).await;
        let age = Duration::from_secs(hours * 3600);
        let now = self.time.now();

        let expired: Vec<PathBuf> = metas
            .iter()
            .filter(|meta| meta.older_than(age, now))
            .map(|meta| meta.path.clone())
            .collect();
        let report = self.fs.delete_batch(&expired).await;
        for (path, err) in &report.errors {
            debug!(path = %path.display(), %err, "could not delete expired response");
        }
        Ok(report.deleted)
    }
}
