//! Loop fan-out over an array variable

use crate::helpers::*;
use funcflow::core::ExecutionError;
use serde_json::{json, Value};
use std::time::Duration;

fn loop_project(in_parallel: bool) -> String {
    format!(
        r#"
settings:
  loop_thread_count: 3
routes:
  echo:
    target_hosts: [{{host: "http://echo"}}]
func_groups:
  fanout:
    func_steps:
      each:
        route_name: echo
        loop_variable: "{{{{.Vars.Body.items}}}}"
        loop_in_parallel: {}
        request_transformation: '{{"n": {{{{.Vars.LoopVar}}}} }}'
        request_headers:
          - key: X-Item
            value: "{{{{.Vars.LoopVar}}}}"
            is_template: true
"#,
        in_parallel
    )
}

/// Earlier items answer later
fn reversed_delay(body: &Value) -> Duration {
    let n = body["n"].as_u64().unwrap_or(0);
    Duration::from_millis(30 * (4 - n.min(3)))
}

#[tokio::test]
async fn test_parallel_loop_merges_in_dispatch_order() {
    let backend = MockBackend::new().delay("echo", reversed_delay);
    let harness = Harness::new(&loop_project(true), backend);

    let outcome = harness
        .run("fanout", json!({"items": [1, 2, 3]}))
        .await
        .unwrap();

    assert_eq!(
        outcome.response.body_value(),
        json!([{"n": 1}, {"n": 2}, {"n": 3}])
    );
    assert_eq!(harness.backend.call_count(), 3);
    assert!(harness.backend.max_in_flight() > 1);
    assert!(harness.backend.max_in_flight() <= 3);
}

#[tokio::test]
async fn test_sequential_loop_runs_one_at_a_time() {
    let harness = Harness::new(&loop_project(false), MockBackend::new());

    let outcome = harness
        .run("fanout", json!({"items": [1, 2, 3]}))
        .await
        .unwrap();

    assert_eq!(harness.backend.max_in_flight(), 1);
    let sent: Vec<Value> = harness.backend.calls().into_iter().map(|c| c.body).collect();
    assert_eq!(sent, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    assert_eq!(outcome.response.body_value().as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn test_iterations_do_not_share_mutations() {
    let backend = MockBackend::new().delay("echo", reversed_delay);
    let harness = Harness::new(&loop_project(true), backend);

    harness
        .run("fanout", json!({"items": [1, 2, 3]}))
        .await
        .unwrap();

    for call in harness.backend.calls() {
        let item = call.body["n"].to_string();
        assert_eq!(call.headers.get("x-item"), Some(&item));
    }
}

#[tokio::test]
async fn test_loop_over_non_array_dispatches_nothing() {
    let harness = Harness::new(&loop_project(true), MockBackend::new());

    let err = harness
        .run("fanout", json!({"items": "not-a-list"}))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::LoopNotArray(_)));
    assert!(err.to_string().contains("not an array"));
    assert_eq!(harness.backend.call_count(), 0);
}

#[tokio::test]
async fn test_loop_over_missing_value_dispatches_nothing() {
    let harness = Harness::new(&loop_project(true), MockBackend::new());

    let err = harness.run("fanout", json!({})).await.unwrap_err();

    assert!(matches!(err, ExecutionError::LoopNotArray(_)));
    assert_eq!(harness.backend.call_count(), 0);
}

#[tokio::test]
async fn test_single_item_loop_is_not_wrapped() {
    let harness = Harness::new(&loop_project(true), MockBackend::new());

    let outcome = harness.run("fanout", json!({"items": [5]})).await.unwrap();

    assert_eq!(outcome.response.body_value(), json!({"n": 5}));
}

#[tokio::test]
async fn test_empty_loop_runs_once() {
    let yaml = r#"
routes:
  echo:
    target_hosts: [{host: "http://echo"}]
func_groups:
  fanout:
    func_steps:
      each:
        route_name: echo
        loop_variable: "{{.Vars.Body.items}}"
"#;
    let harness = Harness::new(yaml, MockBackend::new());

    let outcome = harness.run("fanout", json!({"items": []})).await.unwrap();

    assert_eq!(harness.backend.call_count(), 1);
    assert_eq!(outcome.response.body_value(), json!({"items": []}));
}
