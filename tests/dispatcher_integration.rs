//! Black-box tests of the tool dispatch path
//!
//! These exercise only the dispatcher's externally visible behavior: the
//! envelope shape, the order of rejections, and the drop-zone side effects.

mod common;

use common::{event_file_count, harness};
use serde_json::json;
use std::time::Duration;
use telebridge::dispatch::ClientIdentity;

#[tokio::test]
async fn unknown_tool_returns_typed_envelope() {
    let h = harness(true, |_| {}).await;
    let result = h
        .runtime
        .dispatcher
        .invoke_enveloped("definitely_not_a_tool", json!({}), ClientIdentity::default())
        .await;
    assert_eq!(result["error"], true);
    assert_eq!(result["kind"], "UNKNOWN_TOOL");
    assert!(result["correlation_id"].is_string());
}

#[tokio::test]
async fn missing_required_field_is_a_validation_error() {
    let h = harness(true, |_| {}).await;
    let result = h
        .runtime
        .dispatcher
        .invoke_enveloped(
            "send_event",
            json!({"type": "task_completion", "title": "x"}),
            ClientIdentity::default(),
        )
        .await;
    assert_eq!(result["kind"], "VALIDATION_ERROR");
    assert_eq!(result["details"]["field"], "description");
    assert_eq!(event_file_count(&h.events_dir), 0);
}

#[tokio::test]
async fn event_type_outside_the_enumerated_set_is_rejected() {
    let h = harness(true, |_| {}).await;
    let result = h
        .runtime
        .dispatcher
        .invoke_enveloped(
            "send_event",
            json!({"type": "quantum_flux", "title": "x", "description": ""}),
            ClientIdentity::default(),
        )
        .await;
    assert_eq!(result["kind"], "VALIDATION_ERROR");
    assert_eq!(result["details"]["field"], "type");
}

#[tokio::test]
async fn auth_rejects_missing_and_wrong_keys() {
    let h = harness(true, |config| {
        config.enable_auth = true;
        config.default_api_key = Some("secret-key".to_string());
    })
    .await;

    let no_key = h
        .runtime
        .dispatcher
        .invoke_enveloped("list_event_types", json!({}), ClientIdentity::default())
        .await;
    assert_eq!(no_key["kind"], "AUTHENTICATION_ERROR");

    let wrong_key = h
        .runtime
        .dispatcher
        .invoke_enveloped(
            "list_event_types",
            json!({}),
            ClientIdentity {
                api_key: Some("nope".to_string()),
                ..ClientIdentity::default()
            },
        )
        .await;
    assert_eq!(wrong_key["kind"], "AUTHENTICATION_ERROR");

    let right_key = h
        .runtime
        .dispatcher
        .invoke_enveloped(
            "list_event_types",
            json!({}),
            ClientIdentity {
                api_key: Some("secret-key".to_string()),
                ..ClientIdentity::default()
            },
        )
        .await;
    assert_eq!(right_key["count"], 16);
}

#[test_log::test(tokio::test)]
async fn third_call_past_the_per_tool_limit_is_rejected_without_a_file() {
    let h = harness(true, |config| {
        config.rate_limit.enabled = true;
        config.rate_limit.per_tool_max = 2;
        config.rate_limit.max_requests = 1000;
        config.rate_limit.burst_max = 1000;
    })
    .await;

    let arguments = json!({"type": "info_notification", "title": "ping", "description": ""});
    for _ in 0..2 {
        let ok = h
            .runtime
            .dispatcher
            .invoke_enveloped("send_event", arguments.clone(), ClientIdentity::default())
            .await;
        assert_eq!(ok["success"], true, "call under the limit failed: {ok}");
    }
    assert_eq!(event_file_count(&h.events_dir), 2);

    let rejected = h
        .runtime
        .dispatcher
        .invoke_enveloped("send_event", arguments, ClientIdentity::default())
        .await;
    assert_eq!(rejected["kind"], "RATE_LIMIT_EXCEEDED");
    assert!(rejected["retry_after_s"].as_u64().unwrap() > 0);
    // the rejected call produced no drop-zone artifact
    assert_eq!(event_file_count(&h.events_dir), 2);
}

#[test_log::test(tokio::test)]
async fn script_injection_is_blocked_before_any_file_is_written() {
    let h = harness(true, |_| {}).await;
    let result = h
        .runtime
        .dispatcher
        .invoke_enveloped(
            "send_message",
            json!({"message": "<script>alert(1)</script>"}),
            ClientIdentity {
                source_ip: Some("10.1.2.3".to_string()),
                ..ClientIdentity::default()
            },
        )
        .await;
    assert_eq!(result["kind"], "SECURITY_BLOCKED");
    assert_eq!(result["details"]["rule"], "script_injection");
    assert_eq!(event_file_count(&h.events_dir), 0);

    // the block action put the source on the blocklist: a clean follow-up
    // from the same address is still reported as a threat
    let followup = h
        .runtime
        .dispatcher
        .invoke_enveloped(
            "send_message",
            json!({"message": "hello again"}),
            ClientIdentity {
                source_ip: Some("10.1.2.3".to_string()),
                ..ClientIdentity::default()
            },
        )
        .await;
    assert_eq!(followup["kind"], "SECURITY_BLOCKED");
}

#[tokio::test]
async fn zero_deadline_times_out_without_io() {
    let h = harness(true, |_| {}).await;
    let before = h.bridge.health_hits.load(std::sync::atomic::Ordering::SeqCst);
    let result = h
        .runtime
        .dispatcher
        .invoke_enveloped(
            "send_event",
            json!({"type": "info_notification", "title": "x", "description": ""}),
            ClientIdentity {
                deadline: Some(Duration::ZERO),
                ..ClientIdentity::default()
            },
        )
        .await;
    assert_eq!(result["kind"], "TIMEOUT");
    assert_eq!(event_file_count(&h.events_dir), 0);
    let after = h.bridge.health_hits.load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(before, after, "zero deadline must not reach the bridge");
}

#[tokio::test]
async fn list_event_types_enumerates_the_full_set() {
    let h = harness(true, |_| {}).await;
    let result = h
        .runtime
        .dispatcher
        .invoke_enveloped("list_event_types", json!({}), ClientIdentity::default())
        .await;
    assert_eq!(result["count"], 16);
    let names: Vec<&str> = result["event_types"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"approval_request"));
    assert!(names.contains(&"task_completion"));
}

#[tokio::test]
async fn get_bridge_status_reads_health_and_metrics() {
    let h = harness(true, |_| {}).await;
    let status = h
        .runtime
        .dispatcher
        .invoke_enveloped("get_bridge_status", json!({}), ClientIdentity::default())
        .await;
    assert_eq!(status["running"], true);
    assert_eq!(status["health"], "healthy");
    assert_eq!(status["uptime_seconds"], 321);
    assert_eq!(status["events_processed"], 42);
    assert_eq!(status["telegram_messages_sent"], 40);
    assert_eq!(status["error_count"], 1);
    assert_eq!(status["memory_mb"], 50.0);
}
