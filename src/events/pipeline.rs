//! Durable event writes into the drop-zone
//!
//! The commit point is a rename: the payload lands in
//! `<event_id>_<epoch_ms>.json.tmp`, is fsynced, and only then renamed to
//! its final name. An aborted call never leaves a `.json` behind and the
//! consumer never observes a partial write. Large payloads borrow a pooled
//! buffer unless the pool is under memory pressure.

use crate::bridge::BridgeManager;
use crate::buffer_pool::{BufferPool, POOLED_WRITE_CUTOFF};
use crate::domain_types::{EventDescription, EventId, EventTitle, SourceName, TaskId};
use crate::error::{CoreError, Result};
use crate::events::{Event, EventData, EventLedger, EventType};
use crate::observability::MetricsRegistry;
use crate::time_provider::SharedTimeProvider;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Result of a successful `send`
#[derive(Debug, Clone, serde::Serialize)]
pub struct SendOutcome {
    pub success: bool,
    pub event_id: String,
    pub file_path: PathBuf,
}

/// Caller-facing draft; the pipeline fills identity and timestamp
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub title: EventTitle,
    pub description: EventDescription,
    pub task_id: Option<TaskId>,
    pub event_id: Option<EventId>,
    pub source: Option<SourceName>,
    pub data: EventData,
}

/// Writes validated events into the events drop-zone
pub struct EventPipeline {
    events_dir: PathBuf,
    bridge: Arc<BridgeManager>,
    buffer_pool: Arc<BufferPool>,
    metrics: Arc<MetricsRegistry>,
    ledger: Arc<EventLedger>,
    time: SharedTimeProvider,
}

impl EventPipeline {
    /// Creates a pipeline writing into `events_dir`
    pub fn new(
        events_dir: PathBuf,
        bridge: Arc<BridgeManager>,
        buffer_pool: Arc<BufferPool>,
        metrics: Arc<MetricsRegistry>,
        ledger: Arc<EventLedger>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            events_dir,
            bridge,
            buffer_pool,
            metrics,
            ledger,
            time,
        }
    }

    /// Directory this pipeline commits into
    pub fn events_dir(&self) -> &PathBuf {
        &self.events_dir
    }

    /// Gates on bridge readiness, completes the draft, and commits it
    #[instrument(skip(self, draft, cancel), fields(event_type = %draft.event_type))]
    pub async fn send(&self, draft: EventDraft, cancel: &CancellationToken) -> Result<SendOutcome> {
        self.bridge.ensure_ready(cancel).await?;
        let event = self.complete(draft);
        self.commit(&event, cancel).await
    }

    /// Completes identity fields: a caller-supplied `task_id` doubles as the
    /// `event_id` when it is filename-safe and no explicit id was given
    fn complete(&self, draft: EventDraft) -> Event {
        let event_id = draft.event_id.unwrap_or_else(|| {
            draft
                .task_id
                .as_ref()
                .and_then(|task_id| EventId::try_new(task_id.as_str().to_string()).ok())
                .unwrap_or_else(EventId::generate)
        });
        let task_id = draft.task_id.unwrap_or_else(|| {
            TaskId::try_new(event_id.as_str().to_string())
                .unwrap_or_else(|_| unreachable!("event ids are valid task ids"))
        });

        Event {
            event_id,
            task_id,
            event_type: draft.event_type,
            source: draft.source.unwrap_or_default(),
            timestamp: self.time.now_utc(),
            title: draft.title,
            description: draft.description,
            data: draft.data,
        }
    }

    /// Serializes and atomically writes one completed event
    async fn commit(&self, event: &Event, cancel: &CancellationToken) -> Result<SendOutcome> {
        if cancel.is_cancelled() {
            return Err(CoreError::Timeout {
                operation: "send_event".to_string(),
                timeout_ms: 0,
            });
        }

        let payload = serde_json::to_vec_pretty(event)?;
        let epoch_ms = self.time.epoch_millis();
        let final_name = format!("{}_{epoch_ms}.json", event.event_id);
        let final_path = self.events_dir.join(&final_name);
        let tmp_path = self.events_dir.join(format!("{final_name}.tmp"));

        tokio::fs::create_dir_all(&self.events_dir).await?;

        let pooled = payload.len() >= POOLED_WRITE_CUTOFF && !self.buffer_pool.is_degraded();
        let write_result = if pooled {
            let mut lease = self.buffer_pool.acquire(payload.len());
            lease.as_mut().extend_from_slice(&payload);
            self.write_and_rename(&tmp_path, &final_path, lease.as_slice())
                .await
        } else {
            self.write_and_rename(&tmp_path, &final_path, &payload).await
        };

        if let Err(err) = write_result {
            // never leave a visible artifact behind an aborted call
            let _ = tokio::fs::remove_file(&tmp_path).await;
            self.metrics
                .inc_counter("event_write_failures_total", &[], 1.0);
            return Err(err);
        }

        let meta = tokio::fs::metadata(&final_path).await?;
        if meta.len() == 0 {
            return Err(CoreError::Internal {
                message: format!("event file {final_name} committed empty"),
            });
        }

        self.ledger
            .record(event.event_id.as_str(), event.timestamp);
        self.metrics.inc_counter(
            "events_written_total",
            &[("type", event.event_type.as_str())],
            1.0,
        );
        self.metrics
            .observe_histogram("event_payload_bytes", &[], payload.len() as f64);
        debug!(
            event_id = %event.event_id,
            path = %final_path.display(),
            bytes = payload.len(),
            pooled,
            "event committed"
        );

        Ok(SendOutcome {
            success: true,
            event_id: event.event_id.as_str().to_string(),
            file_path: final_path,
        })
    }

    async fn write_and_rename(
        &self,
        tmp_path: &PathBuf,
        final_path: &PathBuf,
        payload: &[u8],
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        file.write_all(payload).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(tmp_path, final_path).await?;
        Ok(())
    }
}
