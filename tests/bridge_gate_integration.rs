//! Ready-gate behavior: single-flight starts and failure inheritance

mod common;

use common::spawn_mock_bridge;
use std::sync::Arc;
use telebridge::bridge::BridgeManager;
use telebridge::config::{BreakerConfig, RetryConfig};
use telebridge::domain_types::{FailureThreshold, MaxAttempts};
use telebridge::error::CoreError;
use telebridge::resilience::HttpClientPool;
use telebridge::time_provider::production_time_provider;
use tokio_util::sync::CancellationToken;

fn fast_pool() -> Arc<HttpClientPool> {
    // probes against a not-yet-ready endpoint must not trip the breaker
    // or stretch the test with long backoff
    Arc::new(
        HttpClientPool::new(
            RetryConfig {
                max_attempts: MaxAttempts::try_new(1).unwrap(),
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            BreakerConfig {
                failure_threshold: FailureThreshold::try_new(100).unwrap(),
                ..BreakerConfig::default()
            },
            production_time_provider(),
        )
        .unwrap(),
    )
}

#[cfg(unix)]
#[tokio::test]
async fn three_concurrent_callers_share_one_start() {
    use std::os::unix::fs::PermissionsExt;

    let mock = spawn_mock_bridge(false).await;

    // a disposable "bridge": a script that stays alive until stopped
    let exe_name = format!("telebridge-fake-bridge-{}", std::process::id());
    let release_dir = std::path::Path::new("./target/release");
    std::fs::create_dir_all(release_dir).unwrap();
    let exe_path = release_dir.join(&exe_name);
    std::fs::write(&exe_path, "#!/bin/sh\nsleep 30\n").unwrap();
    std::fs::set_permissions(&exe_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let env_dir = tempfile::tempdir().unwrap();
    let env_file = env_dir.path().join("bridge.env");
    std::fs::write(&env_file, "BOT_TOKEN=test-token\nALLOWED_USERS=1,2\n").unwrap();

    let manager = Arc::new(BridgeManager::new(
        &exe_name,
        &format!("http://{}", mock.addr),
        vec![env_file],
        fast_pool(),
        production_time_provider(),
    ));

    // the endpoint comes up as soon as a start attempt is observed,
    // mimicking the real bridge binding its health port
    let ready = Arc::clone(&mock.ready);
    let watcher = Arc::clone(&manager);
    tokio::spawn(async move {
        loop {
            if watcher.start_attempt_count() > 0 {
                ready.store(true, std::sync::atomic::Ordering::SeqCst);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    });

    let callers: Vec<_> = (0..3)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure_ready(&CancellationToken::new()).await })
        })
        .collect();
    let outcomes: Vec<_> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    for outcome in &outcomes {
        assert!(outcome.is_ok(), "a caller failed: {outcome:?}");
    }
    assert_eq!(
        manager.start_attempt_count(),
        1,
        "concurrent callers must collapse onto one start"
    );

    // cleanup: kill the fake bridge
    let _ = manager.stop().await;
    let _ = std::fs::remove_file(&exe_path);
}

#[tokio::test]
async fn missing_executable_fails_every_caller_within_the_attempt_cap() {
    let mock = spawn_mock_bridge(false).await;
    let manager = Arc::new(BridgeManager::new(
        "telebridge-no-such-executable",
        &format!("http://{}", mock.addr),
        Vec::new(),
        fast_pool(),
        production_time_provider(),
    ));

    let callers: Vec<_> = (0..3)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure_ready(&CancellationToken::new()).await })
        })
        .collect();
    let outcomes: Vec<_> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    for outcome in outcomes {
        match outcome {
            Err(CoreError::BridgeNotFound { .. } | CoreError::BridgeStartFailed { .. }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert!(
        manager.start_attempt_count() <= 3,
        "start attempts exceeded the configured cap"
    );
}

#[tokio::test]
async fn wait_for_ready_succeeds_once_the_endpoint_comes_up() {
    let mock = spawn_mock_bridge(false).await;
    let manager = BridgeManager::new(
        "telebridge-no-such-executable",
        &format!("http://{}", mock.addr),
        Vec::new(),
        fast_pool(),
        production_time_provider(),
    );

    let ready = Arc::clone(&mock.ready);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        ready.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    manager
        .wait_for_ready(&CancellationToken::new())
        .await
        .expect("endpoint came up within the budget");
}

#[tokio::test]
async fn wait_for_ready_honors_cancellation() {
    let mock = spawn_mock_bridge(false).await;
    let manager = BridgeManager::new(
        "telebridge-no-such-executable",
        &format!("http://{}", mock.addr),
        Vec::new(),
        fast_pool(),
        production_time_provider(),
    );

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let result = manager.wait_for_ready(&cancel).await;
    assert!(matches!(result, Err(CoreError::Timeout { .. })));
    assert!(
        started.elapsed() < std::time::Duration::from_secs(5),
        "cancellation must abort the loop promptly"
    );
}

#[tokio::test]
async fn liveness_cache_avoids_repeat_probes_within_ttl() {
    let mock = spawn_mock_bridge(true).await;
    let manager = BridgeManager::new(
        "telebridge-no-such-executable",
        &format!("http://{}", mock.addr),
        Vec::new(),
        fast_pool(),
        production_time_provider(),
    );
    let cancel = CancellationToken::new();

    assert!(manager.is_running_cached(&cancel).await);
    let hits_after_first = mock.health_hits.load(std::sync::atomic::Ordering::SeqCst);
    for _ in 0..5 {
        assert!(manager.is_running_cached(&cancel).await);
    }
    let hits_after_burst = mock.health_hits.load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(hits_after_first, hits_after_burst, "cache must absorb probes");

    manager.clear_cache();
    assert!(manager.is_running_cached(&cancel).await);
    assert!(mock.health_hits.load(std::sync::atomic::Ordering::SeqCst) > hits_after_burst);
}
