//! Metric threshold → bus → alert engine → channel dispatch, end to end

mod common;

use common::harness;
use std::time::Duration;
use telebridge::alerting::AlertStatus;
use telebridge::config::AlertChannelConfig;

#[tokio::test]
async fn threshold_violation_becomes_a_dispatched_alert() {
    let mut h = harness(true, |config| {
        config.alerting.channels.push(AlertChannelConfig {
            name: "ops-telegram".to_string(),
            kind: "telegram".to_string(),
            target: String::new(),
            severities: Vec::new(),
        });
    })
    .await;
    h.runtime.start_background();

    // the runtime watches security_blocked_total with a zero-duration
    // critical threshold at 50
    h.runtime
        .components
        .metrics
        .inc_counter("security_blocked_total", &[], 60.0);

    // intake is asynchronous; poll until the alert lands
    let mut alert = None;
    for _ in 0..100 {
        let active = h.runtime.alerts.active_alerts();
        if let Some(found) = active.first() {
            alert = Some(found.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let alert = alert.expect("threshold violation never reached the alert engine");
    assert_eq!(alert.status, AlertStatus::Firing);
    assert_eq!(alert.metric, "security_blocked_total");
    assert_eq!(alert.current_value, 60.0);
    assert_eq!(alert.fingerprint.len(), 16);
    assert_eq!(alert.channels, vec!["ops-telegram".to_string()]);

    // the telegram channel writes the alert into the events drop-zone;
    // either the background dispatch loop or this call delivers it
    h.runtime.alerts.dispatch_pending().await;
    let mut alert_files = 0;
    for _ in 0..100 {
        alert_files = std::fs::read_dir(&h.events_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("alert-"))
            .count();
        if alert_files == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(alert_files, 1);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn repeated_violations_fold_into_one_alert() {
    let mut h = harness(true, |_| {}).await;
    h.runtime.start_background();

    for value in [60.0, 10.0, 5.0] {
        h.runtime
            .components
            .metrics
            .inc_counter("security_blocked_total", &[], value);
    }

    let mut seen = 0;
    for _ in 0..100 {
        seen = h.runtime.alerts.active_alerts().len();
        if seen > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, 1, "same fingerprint must fold into one alert");

    h.runtime.shutdown().await;
}
