//! Backend errors under the STOP and IGNORE policies

use crate::helpers::*;
use funcflow::backend::BackendError;
use funcflow::core::ExecutionError;
use http::StatusCode;
use serde_json::json;

fn project(on_error: &str) -> String {
    format!(
        r#"
routes:
  flaky:
    target_hosts: [{{host: "http://flaky"}}]
    on_error: {}
  audit:
    target_hosts: [{{host: "http://audit"}}]
func_groups:
  checkout:
    response_status_code: 409
    func_steps:
      charge:
        route_name: flaky
        func_steps:
          record:
            route_name: audit
"#,
        on_error
    )
}

fn failing() -> MockBackend {
    MockBackend::new().reply("flaky", |_| {
        Ok(json_response(StatusCode::SERVICE_UNAVAILABLE, json!({"retry": true})))
    })
}

#[tokio::test]
async fn test_stop_propagates_backend_response() {
    let harness = Harness::new(&project("STOP"), failing());

    let err = harness.run("checkout", json!({})).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Backend { .. }));

    let response = harness.respond("checkout", json!({})).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body_value(), json!({"retry": true}));
    assert!(!harness.backend.targets().contains(&"audit".to_string()));
}

#[tokio::test]
async fn test_ignore_substitutes_empty_body_and_continues() {
    let harness = Harness::new(&project("IGNORE"), failing());

    let outcome = harness.run("checkout", json!({"cart": 1})).await.unwrap();

    assert_eq!(harness.backend.targets(), vec!["flaky", "audit"]);
    // The child sees the substituted empty body
    assert_eq!(harness.backend.calls()[1].body, json!({}));
    assert_eq!(outcome.response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_transport_error_uses_pipeline_status() {
    let backend = MockBackend::new().reply("flaky", |_| {
        Err(BackendError::Transport("connection refused".to_string()))
    });
    let harness = Harness::new(&project("STOP"), backend);

    let response = harness.respond("checkout", json!({})).await;

    assert_eq!(response.status.as_u16(), 409);
    assert!(response.body_value()["error"]
        .as_str()
        .unwrap()
        .contains("connection refused"));
}
