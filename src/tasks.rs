//! Read-only task-status aggregation over external trackers
//!
//! Two trackers are recognized: the session todo list under `.claude/` and
//! the TaskMaster store under `.taskmaster/`, both read live from their
//! canonical JSON files on every call. TaskMaster subtasks are flattened
//! into `<parent>.<child>` synthetic ids so counts include the full tree.
//! A missing tracker is reported, never fatal.

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which tracker(s) to consult
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSystem {
    ClaudeCode,
    TaskMaster,
    Both,
}

impl TaskSystem {
    /// Parses the tool argument; unknown values ask for both
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("claude-code") => TaskSystem::ClaudeCode,
            Some("taskmaster") => TaskSystem::TaskMaster,
            _ => TaskSystem::Both,
        }
    }
}

/// Normalized task status buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().replace('-', "_").as_str() {
            "completed" | "done" => TaskStatus::Completed,
            "in_progress" | "active" => TaskStatus::InProgress,
            "blocked" | "deferred" | "cancelled" => TaskStatus::Blocked,
            _ => TaskStatus::Pending,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

/// One normalized task
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Counts per status bucket
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
}

impl TaskCounts {
    fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Blocked => self.blocked += 1,
        }
    }

    fn merge(&mut self, other: &TaskCounts) {
        self.pending += other.pending;
        self.in_progress += other.in_progress;
        self.completed += other.completed;
        self.blocked += other.blocked;
    }

    /// Total across all buckets
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.blocked
    }
}

/// One tracker's contribution to the report
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSummary {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub counts: TaskCounts,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskRecord>,
}

impl TrackerSummary {
    fn unavailable(reason: String) -> Self {
        Self {
            available: false,
            reason: Some(reason),
            counts: TaskCounts::default(),
            tasks: Vec::new(),
        }
    }
}

/// Combined report across requested trackers
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub trackers: BTreeMap<String, TrackerSummary>,
    pub combined: TaskCounts,
}

/// Live reader over the tracker files
#[derive(Debug, Clone, Default)]
pub struct TaskAggregator;

impl TaskAggregator {
    /// Creates the aggregator
    pub fn new() -> Self {
        Self
    }

    /// Reads the requested trackers and merges their counts
    pub async fn status(
        &self,
        project_root: &Path,
        system: TaskSystem,
        status_filter: Option<&str>,
        summary_only: bool,
    ) -> Result<TaskStatusReport> {
        let mut trackers = BTreeMap::new();
        let filter = status_filter.map(TaskStatus::parse);

        if matches!(system, TaskSystem::ClaudeCode | TaskSystem::Both) {
            trackers.insert(
                "claude-code".to_string(),
                self.read_claude(project_root, filter, summary_only).await,
            );
        }
        if matches!(system, TaskSystem::TaskMaster | TaskSystem::Both) {
            trackers.insert(
                "taskmaster".to_string(),
                self.read_taskmaster(project_root, filter, summary_only)
                    .await,
            );
        }

        let mut combined = TaskCounts::default();
        for summary in trackers.values() {
            combined.merge(&summary.counts);
        }
        Ok(TaskStatusReport { trackers, combined })
    }

    /// Session todos: `.claude/todos.json` plus any per-session arrays
    /// under `.claude/todos/`
    async fn read_claude(
        &self,
        project_root: &Path,
        filter: Option<TaskStatus>,
        summary_only: bool,
    ) -> TrackerSummary {
        let base = project_root.join(".claude");
        let mut sources: Vec<(String, Value)> = Vec::new();

        let flat = base.join("todos.json");
        if let Some(root) = read_json(&flat).await {
            sources.push(("todos".to_string(), root));
        }
        if let Ok(mut entries) = tokio::fs::read_dir(base.join("todos")).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(root) = read_json(&path).await {
                    let session = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| "session".to_string());
                    sources.push((session, root));
                }
            }
        }
        if sources.is_empty() {
            return TrackerSummary::unavailable(format!(
                "no todo store under {}",
                base.display()
            ));
        }

        let mut tasks = Vec::new();
        for (session, root) in &sources {
            let Some(items) = root.as_array() else {
                continue;
            };
            for (index, item) in items.iter().enumerate() {
                tasks.push(TaskRecord {
                    id: string_field(item, "id")
                        .unwrap_or_else(|| format!("{session}-{index}")),
                    title: string_field(item, "content")
                        .or_else(|| string_field(item, "title"))
                        .unwrap_or_else(|| "untitled".to_string()),
                    status: TaskStatus::parse(&string_field(item, "status").unwrap_or_default()),
                    parent_id: None,
                });
            }
        }
        summarize(tasks, filter, summary_only)
    }

    /// TaskMaster store: `tasks` with nested `subtasks`, flattened
    async fn read_taskmaster(
        &self,
        project_root: &Path,
        filter: Option<TaskStatus>,
        summary_only: bool,
    ) -> TrackerSummary {
        let path = taskmaster_path(project_root);
        let Some(root) = read_json(&path).await else {
            return TrackerSummary::unavailable(format!("{} not found", path.display()));
        };
        let items = root
            .get("tasks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if items.is_empty() && root.get("tasks").is_none() {
            return TrackerSummary::unavailable(format!(
                "{} has no tasks collection",
                path.display()
            ));
        }

        let mut tasks = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let parent_id = string_field(item, "id")
                .or_else(|| item.get("id").map(|v| v.to_string()))
                .unwrap_or_else(|| format!("task-{index}"));
            tasks.push(TaskRecord {
                id: parent_id.clone(),
                title: string_field(item, "title").unwrap_or_else(|| "untitled".to_string()),
                status: TaskStatus::parse(&string_field(item, "status").unwrap_or_default()),
                parent_id: None,
            });
            for (sub_index, subtask) in item
                .get("subtasks")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .enumerate()
            {
                let child_id = string_field(subtask, "id")
                    .or_else(|| subtask.get("id").map(|v| v.to_string()))
                    .unwrap_or_else(|| format!("{sub_index}"));
                tasks.push(TaskRecord {
                    id: format!("{parent_id}.{child_id}"),
                    title: string_field(subtask, "title").unwrap_or_else(|| "untitled".to_string()),
                    status: TaskStatus::parse(&string_field(subtask, "status").unwrap_or_default()),
                    parent_id: Some(parent_id.clone()),
                });
            }
        }
        summarize(tasks, filter, summary_only)
    }
}

fn taskmaster_path(project_root: &Path) -> PathBuf {
    project_root
        .join(".taskmaster")
        .join("tasks")
        .join("tasks.json")
}

async fn read_json(path: &Path) -> Option<Value> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(path = %path.display(), %err, "tracker file is not valid JSON");
            None
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn summarize(
    tasks: Vec<TaskRecord>,
    filter: Option<TaskStatus>,
    summary_only: bool,
) -> TrackerSummary {
    let filtered: Vec<TaskRecord> = match filter {
        Some(wanted) => tasks.into_iter().filter(|t| t.status == wanted).collect(),
        None => tasks,
    };
    let mut counts = TaskCounts::default();
    for task in &filtered {
        counts.add(task.status);
    }
    TrackerSummary {
        available: true,
        reason: None,
        counts,
        tasks: if summary_only { Vec::new() } else { filtered },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(path: &Path, value: &Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn missing_trackers_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let report = TaskAggregator::new()
            .status(dir.path(), TaskSystem::Both, None, false)
            .await
            .unwrap();
        assert_eq!(report.trackers.len(), 2);
        for summary in report.trackers.values() {
            assert!(!summary.available);
            assert!(summary.reason.is_some());
        }
        assert_eq!(report.combined.total(), 0);
    }

    #[tokio::test]
    async fn claude_todos_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(".claude/todos.json"),
            &json!([
                {"content": "write tests", "status": "pending"},
                {"content": "fix build", "status": "in_progress"},
                {"content": "ship it", "status": "completed"}
            ]),
        );
        let report = TaskAggregator::new()
            .status(dir.path(), TaskSystem::ClaudeCode, None, false)
            .await
            .unwrap();
        let summary = &report.trackers["claude-code"];
        assert!(summary.available);
        assert_eq!(summary.counts.pending, 1);
        assert_eq!(summary.counts.in_progress, 1);
        assert_eq!(summary.counts.completed, 1);
        assert_eq!(summary.tasks.len(), 3);
    }

    #[tokio::test]
    async fn taskmaster_subtasks_are_flattened_with_parent_linkage() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &taskmaster_path(dir.path()),
            &json!({"tasks": [
                {"id": 1, "title": "parent", "status": "in-progress", "subtasks": [
                    {"id": 1, "title": "child a", "status": "done"},
                    {"id": 2, "title": "child b", "status": "pending"}
                ]},
                {"id": 2, "title": "solo", "status": "deferred"}
            ]}),
        );
        let report = TaskAggregator::new()
            .status(dir.path(), TaskSystem::TaskMaster, None, false)
            .await
            .unwrap();
        let summary = &report.trackers["taskmaster"];
        assert!(summary.available);
        // 2 parents + 2 flattened subtasks
        assert_eq!(summary.counts.total(), 4);
        assert_eq!(summary.counts.completed, 1);
        assert_eq!(summary.counts.blocked, 1);

        let child = summary.tasks.iter().find(|t| t.id == "1.1").unwrap();
        assert_eq!(child.parent_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn session_todo_files_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(".claude/todos.json"),
            &json!([{"content": "root task", "status": "pending"}]),
        );
        write(
            &dir.path().join(".claude/todos/session-a.json"),
            &json!([{"content": "a1", "status": "completed"}]),
        );
        write(
            &dir.path().join(".claude/todos/session-b.json"),
            &json!([{"content": "b1", "status": "in_progress"}]),
        );
        let report = TaskAggregator::new()
            .status(dir.path(), TaskSystem::ClaudeCode, None, false)
            .await
            .unwrap();
        let summary = &report.trackers["claude-code"];
        assert_eq!(summary.counts.total(), 3);
        assert_eq!(summary.counts.completed, 1);
        assert_eq!(summary.counts.in_progress, 1);
    }

    #[tokio::test]
    async fn status_filter_narrows_tasks_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(".claude/todos.json"),
            &json!([
                {"content": "a", "status": "pending"},
                {"content": "b", "status": "completed"}
            ]),
        );
        let report = TaskAggregator::new()
            .status(dir.path(), TaskSystem::ClaudeCode, Some("completed"), false)
            .await
            .unwrap();
        let summary = &report.trackers["claude-code"];
        assert_eq!(summary.counts.total(), 1);
        assert_eq!(summary.tasks[0].status.as_str(), "completed");
    }

    #[tokio::test]
    async fn summary_only_omits_task_bodies() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(".claude/todos.json"),
            &json!([{"content": "a", "status": "pending"}]),
        );
        let report = TaskAggregator::new()
            .status(dir.path(), TaskSystem::ClaudeCode, None, true)
            .await
            .unwrap();
        let summary = &report.trackers["claude-code"];
        assert!(summary.tasks.is_empty());
        assert_eq!(summary.counts.pending, 1);
    }

    #[tokio::test]
    async fn combined_report_merges_both_trackers() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(".claude/todos.json"),
            &json!([{"content": "a", "status": "pending"}]),
        );
        write(
            &taskmaster_path(dir.path()),
            &json!({"tasks": [{"id": 1, "title": "b", "status": "done"}]}),
        );
        let report = TaskAggregator::new()
            .status(dir.path(), TaskSystem::Both, None, true)
            .await
            .unwrap();
        assert_eq!(report.combined.pending, 1);
        assert_eq!(report.combined.completed, 1);
        assert_eq!(report.combined.total(), 2);
    }
}
