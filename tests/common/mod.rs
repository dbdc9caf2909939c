//! Shared fixtures: a mock delivery-bridge HTTP endpoint and runtime setup

// not every test binary uses every fixture
#![allow(dead_code)]

use axum::Json;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use telebridge::config::Config;
use telebridge::runtime::CoreRuntime;
use telebridge::time_provider::test_time_provider;

/// A stand-in for the external bridge's health/metrics endpoint
pub struct MockBridge {
    pub addr: SocketAddr,
    pub ready: Arc<AtomicBool>,
    pub health_hits: Arc<AtomicU64>,
}

/// Serves `/health` (200 when `ready`, 503 otherwise) and `/metrics`
pub async fn spawn_mock_bridge(initially_ready: bool) -> MockBridge {
    let ready = Arc::new(AtomicBool::new(initially_ready));
    let health_hits = Arc::new(AtomicU64::new(0));

    let ready_for_handler = Arc::clone(&ready);
    let hits_for_handler = Arc::clone(&health_hits);
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let ready = Arc::clone(&ready_for_handler);
                let hits = Arc::clone(&hits_for_handler);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if ready.load(Ordering::SeqCst) {
                        (
                            StatusCode::OK,
                            Json(json!({
                                "status": "healthy",
                                "last_event_time": "2026-07-01T10:00:00Z",
                                "build_info": env!("CARGO_PKG_VERSION"),
                            })),
                        )
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "starting"})))
                    }
                }
            }),
        )
        .route(
            "/metrics",
            get(|| async {
                "process_uptime_seconds 321\n\
                 events_processed_total 42\n\
                 telegram_messages_sent_total 40\n\
                 errors_total 1\n\
                 memory_usage_bytes 52428800\n\
                 cpu_usage_percent 1.5\n"
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockBridge {
        addr,
        ready,
        health_hits,
    }
}

/// A runtime wired to temp drop-zones and the mock bridge endpoint
pub struct TestHarness {
    pub runtime: CoreRuntime,
    pub bridge: MockBridge,
    pub events_dir: std::path::PathBuf,
    pub responses_dir: std::path::PathBuf,
    // owns the tempdir so the drop-zones outlive the test body
    _dir: tempfile::TempDir,
}

/// Builds a harness; `tweak` adjusts the config before the runtime builds
pub async fn harness(initially_ready: bool, tweak: impl FnOnce(&mut Config)) -> TestHarness {
    let bridge = spawn_mock_bridge(initially_ready).await;
    let dir = tempfile::tempdir().unwrap();
    let events_dir = dir.path().join("events");
    let responses_dir = dir.path().join("responses");
    std::fs::create_dir_all(&events_dir).unwrap();
    std::fs::create_dir_all(&responses_dir).unwrap();

    let mut config = Config::development();
    config.events_dir = events_dir.clone();
    config.responses_dir = responses_dir.clone();
    config.health_port = bridge.addr.port();
    tweak(&mut config);

    let runtime = CoreRuntime::build(config, test_time_provider()).unwrap();
    TestHarness {
        runtime,
        bridge,
        events_dir,
        responses_dir,
        _dir: dir,
    }
}

/// Counts committed (non-tmp) event files
pub fn event_file_count(events_dir: &std::path::Path) -> usize {
    std::fs::read_dir(events_dir)
        .map(|entries| {
            entries
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .path()
                        .extension()
                        .is_some_and(|ext| ext == "json")
                })
                .count()
        })
        .unwrap_or(0)
}
