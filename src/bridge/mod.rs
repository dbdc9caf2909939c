//! Bridge subsystem: lifecycle, process operations, status

pub mod lifecycle;
pub mod process;

pub use lifecycle::{BridgeManager, EnsureOutcome};

use serde::Serialize;

/// Cached liveness view, TTL 30 s
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CachedRunning {
    pub running: bool,
    pub cached_at_ms: u64,
}

/// Full bridge status reported by `get_bridge_status`
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub health: String,
    pub uptime_seconds: u64,
    pub events_processed: u64,
    pub telegram_messages_sent: u64,
    pub error_count: u64,
    pub memory_mb: f64,
    pub cpu_pct: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self {
            running: false,
            health: "unknown".to_string(),
            uptime_seconds: 0,
            events_processed: 0,
            telegram_messages_sent: 0,
            error_count: 0,
            memory_mb: 0.0,
            cpu_pct: 0.0,
            last_event_time: None,
            pid: None,
        }
    }
}
