//! Nested pipelines and single-step invocation

use crate::helpers::*;
use funcflow::core::ExecutionError;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const NESTED: &str = r#"
routes:
  users:
    target_hosts: [{host: "http://users"}]
  orders:
    target_hosts: [{host: "http://orders"}]
  report:
    target_hosts: [{host: "http://report"}]
func_groups:
  lookup:
    func_steps:
      a_user:
        route_name: users
        response_transformation: '{"user": {{.Vars.Body.id}} }'
      b_orders:
        route_name: orders
        response_transformation: '{"orders": {{.Vars.Body.id}} }'
  dashboard:
    func_steps:
      gather:
        function_name: lookup
        func_steps:
          render:
            route_name: report
"#;

#[tokio::test]
async fn test_nested_pipeline_feeds_children() {
    let harness = Harness::new(NESTED, MockBackend::new());

    let outcome = harness.run("dashboard", json!({"id": 4})).await.unwrap();

    let mut inner = harness.backend.targets()[..2].to_vec();
    inner.sort();
    assert_eq!(inner, vec!["orders", "users"]);
    assert_eq!(harness.backend.targets()[2], "report");
    // The child receives the nested pipeline's merged body
    assert_eq!(
        harness.backend.calls()[2].body,
        json!([{"user": 4}, {"orders": 4}])
    );
    assert_eq!(
        outcome.response.body_value(),
        json!([{"user": 4}, {"orders": 4}])
    );
    assert!(outcome.scopes.res_vars.contains_key("gather"));
    assert!(outcome.scopes.res_vars.contains_key("a_user"));
}

#[tokio::test]
async fn test_single_step_invocation() {
    let harness = Harness::new(NESTED, MockBackend::new());

    let outcome = harness
        .engine
        .execute(
            CancellationToken::new(),
            json_request(json!({"id": 9})),
            "lookup",
            Some("b_orders"),
        )
        .await
        .unwrap();

    assert_eq!(harness.backend.targets(), vec!["orders"]);
    assert_eq!(outcome.response.body_value(), json!({"orders": 9}));
}

#[tokio::test]
async fn test_unknown_step_is_reported() {
    let harness = Harness::new(NESTED, MockBackend::new());

    let err = harness
        .engine
        .execute(
            CancellationToken::new(),
            json_request(json!({})),
            "lookup",
            Some("missing"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::StepNotFound(_)));
    assert_eq!(harness.backend.call_count(), 0);
}

#[tokio::test]
async fn test_nested_pipeline_receives_shaped_request() {
    let yaml = r#"
routes:
  users:
    target_hosts: [{host: "http://users"}]
func_groups:
  lookup:
    func_steps:
      a_user:
        route_name: users
  outer:
    func_steps:
      gather:
        function_name: lookup
        request_headers:
          - {key: X-Tenant, value: acme}
        request_transformation: '{"id": 99, "was": {{.Vars.Body.id}} }'
"#;
    let harness = Harness::new(yaml, MockBackend::new());

    let outcome = harness.run("outer", json!({"id": 1})).await.unwrap();

    let calls = harness.backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].body, json!({"id": 99, "was": 1}));
    assert_eq!(calls[0].headers.get("x-tenant").map(String::as_str), Some("acme"));
    assert_eq!(outcome.response.body_value(), json!({"id": 99, "was": 1}));
    assert_eq!(outcome.scopes.req_vars["gather"].body, json!({"id": 99, "was": 1}));
}
