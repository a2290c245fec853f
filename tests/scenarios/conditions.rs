//! Conditions: STOP, ERROR and IGNORE policies

use crate::helpers::*;
use http::StatusCode;
use serde_json::json;

const ECHO_CHAIN: &str = r#"
routes:
  echo:
    target_hosts: [{host: "http://echo"}]
  echo2:
    target_hosts: [{host: "http://echo2"}]
func_groups:
  chain:
    func_steps:
      root:
        route_name: echo
        response_transformation: '{"seen": {{.Vars.Body.flag}} }'
        func_steps:
          child:
            route_name: echo2
            condition: "{{eq .Vars.Vars.flag true}}"
            condition_fail_action: STOP
"#;

#[tokio::test]
async fn test_condition_true_runs_child() {
    let harness = Harness::new(ECHO_CHAIN, MockBackend::new());

    let outcome = harness.run("chain", json!({"flag": true})).await.unwrap();

    assert_eq!(harness.backend.targets(), vec!["echo", "echo2"]);
    // The child receives the parent's reshaped body and answers last
    assert_eq!(harness.backend.calls()[1].body, json!({"seen": true}));
    assert_eq!(outcome.response.body_value(), json!({"seen": true}));
}

#[tokio::test]
async fn test_condition_stop_never_dispatches_child() {
    let harness = Harness::new(ECHO_CHAIN, MockBackend::new());

    let outcome = harness.run("chain", json!({"flag": false})).await.unwrap();

    assert_eq!(harness.backend.targets(), vec!["echo"]);
    assert_eq!(outcome.response.status, StatusCode::OK);
    assert_eq!(outcome.response.body_value(), json!({"seen": false}));
    assert!(outcome.scopes.res_vars.contains_key("root"));
    assert!(!outcome.scopes.req_vars.contains_key("child"));
}

#[tokio::test]
async fn test_condition_stop_with_message_answers_200() {
    let yaml = r#"
routes:
  echo:
    target_hosts: [{host: "http://echo"}]
func_groups:
  gate:
    func_steps:
      only:
        route_name: echo
        condition: "{{.Vars.Vars.allowed}}"
        condition_fail_message: '{"reason": "not allowed for {{.Vars.Vars.user}}"}'
"#;
    let harness = Harness::new(yaml, MockBackend::new());

    let outcome = harness
        .run("gate", json!({"allowed": false, "user": "ada"}))
        .await
        .unwrap();

    assert_eq!(harness.backend.call_count(), 0);
    assert_eq!(outcome.response.status, StatusCode::OK);
    assert_eq!(
        outcome.response.body_value(),
        json!({"reason": "not allowed for ada"})
    );
}

#[tokio::test]
async fn test_condition_error_answers_400_with_message() {
    let yaml = r#"
routes:
  echo:
    target_hosts: [{host: "http://echo"}]
func_groups:
  gate:
    func_steps:
      only:
        route_name: echo
        condition: "{{.Vars.Vars.allowed}}"
        condition_fail_action: ERROR
        condition_fail_message: "caller is not allowed"
"#;
    let harness = Harness::new(yaml, MockBackend::new());

    let response = harness.respond("gate", json!({"allowed": false})).await;

    assert_eq!(harness.backend.call_count(), 0);
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        response.body_value(),
        json!({"error": "caller is not allowed"})
    );
}

#[tokio::test]
async fn test_condition_ignore_skips_to_children() {
    let yaml = r#"
routes:
  echo:
    target_hosts: [{host: "http://echo"}]
  echo2:
    target_hosts: [{host: "http://echo2"}]
func_groups:
  skip:
    func_steps:
      parent:
        route_name: echo
        condition: "false"
        condition_fail_action: IGNORE
        func_steps:
          child:
            route_name: echo2
"#;
    let harness = Harness::new(yaml, MockBackend::new());

    let outcome = harness.run("skip", json!({"id": 1})).await.unwrap();

    assert_eq!(harness.backend.targets(), vec!["echo2"]);
    assert_eq!(outcome.response.body_value(), json!({"id": 1}));
}

#[tokio::test]
async fn test_missing_condition_value_holds() {
    let yaml = r#"
routes:
  echo:
    target_hosts: [{host: "http://echo"}]
func_groups:
  gate:
    func_steps:
      only:
        route_name: echo
        condition: "{{.Vars.Vars.absent}}"
"#;
    let harness = Harness::new(yaml, MockBackend::new());

    harness.run("gate", json!({})).await.unwrap();

    assert_eq!(harness.backend.call_count(), 1);
}

const SHAPED_GATE: &str = r#"
routes:
  echo:
    target_hosts: [{host: "http://echo"}]
func_groups:
  gate:
    func_steps:
      only:
        route_name: echo
        request_transformation: '{"flag": {{.Vars.Vars.override}} }'
        condition: "{{.Vars.Body.flag}}"
"#;

#[tokio::test]
async fn test_condition_reads_transformed_body() {
    let harness = Harness::new(SHAPED_GATE, MockBackend::new());

    let outcome = harness
        .run("gate", json!({"flag": true, "override": false}))
        .await
        .unwrap();

    assert_eq!(harness.backend.call_count(), 0);
    assert_eq!(outcome.response.status, StatusCode::OK);
    assert!(!outcome.scopes.res_vars.contains_key("only"));
}

#[tokio::test]
async fn test_condition_passes_on_transformed_body() {
    let harness = Harness::new(SHAPED_GATE, MockBackend::new());

    harness
        .run("gate", json!({"flag": false, "override": true}))
        .await
        .unwrap();

    assert_eq!(harness.backend.targets(), vec!["echo"]);
    assert_eq!(harness.backend.calls()[0].body, json!({"flag": true}));
}
