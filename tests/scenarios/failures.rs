//! Panics, cancellation, timeouts and delays

use crate::helpers::*;
use funcflow::core::ExecutionError;
use funcflow::execution::ExecutionEvent;
use http::StatusCode;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const TWO_BRANCHES: &str = r#"
routes:
  boom:
    target_hosts: [{host: "http://boom"}]
  calm:
    target_hosts: [{host: "http://calm"}]
func_groups:
  mixed:
    func_steps:
      a_boom:
        route_name: boom
      b_calm:
        route_name: calm
"#;

#[tokio::test]
async fn test_worker_panic_becomes_error() {
    let backend = MockBackend::new().reply("boom", |_| panic!("backend exploded"));
    let harness = Harness::new(TWO_BRANCHES, backend);

    let err = harness.run("mixed", json!({})).await.unwrap_err();

    assert!(matches!(err, ExecutionError::Panicked(_)));
    assert!(err.to_string().contains("backend exploded"));
    // The sibling still ran to completion
    assert!(harness.backend.targets().contains(&"calm".to_string()));

    let response = harness.respond("mixed", json!({})).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancelled_invocation_dispatches_nothing() {
    let harness = Harness::new(TWO_BRANCHES, MockBackend::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .engine
        .execute(cancel, json_request(json!({})), "mixed", None)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("cancelled"));
    assert_eq!(harness.backend.call_count(), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_backend_call() {
    let backend = MockBackend::new().delay("calm", |_| Duration::from_secs(5));
    let yaml = r#"
routes:
  calm:
    target_hosts: [{host: "http://calm"}]
func_groups:
  slow:
    func_steps:
      wait:
        route_name: calm
"#;
    let harness = Harness::new(yaml, backend);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = harness
        .engine
        .execute(cancel, json_request(json!({})), "slow", None)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_step_timeout_is_a_backend_error() {
    let yaml = r#"
routes:
  calm:
    target_hosts: [{host: "http://calm"}]
    on_error: IGNORE
func_groups:
  slow:
    func_steps:
      wait:
        route_name: calm
        timeout_secs: 1
"#;
    let backend = MockBackend::new().delay("calm", |_| Duration::from_secs(3));
    let harness = Harness::new(yaml, backend);

    let started = Instant::now();
    let outcome = harness.run("slow", json!({"x": 1})).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(outcome.response.body_value(), json!({}));
}

#[tokio::test]
async fn test_delay_and_events() {
    let yaml = r#"
routes:
  calm:
    target_hosts: [{host: "http://calm"}]
func_groups:
  later:
    func_steps:
      wait:
        route_name: calm
        delay: 50
"#;
    let harness = Harness::new(yaml, MockBackend::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    harness
        .engine
        .add_event_handler(move |event| sink.lock().push(event));

    let started = Instant::now();
    harness.run("later", json!({})).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(50));
    let events = events.lock();
    assert!(matches!(events.first(), Some(ExecutionEvent::PipelineStarted { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::StepCompleted { step_key, status: Some(200), .. } if step_key == "wait"
    )));
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::PipelineCompleted { success: true, status: 200, .. })
    ));
}
