//! Deferred steps: placeholder, hand-off and resumption

use crate::helpers::*;
use async_trait::async_trait;
use funcflow::core::config::ProjectConfig;
use funcflow::core::AsyncStatus;
use funcflow::execution::{ExecutionEngine, ResumeOutcome};
use funcflow::persistence::{
    AsyncStore, InMemoryAsyncStore, MessageQueue, QueueMessage, QueueRegistry,
};
use http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Queue whose broker refuses every publish
struct ClosedQueue;

#[async_trait]
impl MessageQueue for ClosedQueue {
    fn name(&self) -> &str {
        "jobs"
    }

    async fn publish(&self, _body: &str) -> anyhow::Result<String> {
        anyhow::bail!("broker unavailable")
    }

    async fn poll(&self, _max: usize) -> anyhow::Result<Vec<QueueMessage>> {
        Ok(Vec::new())
    }

    async fn delete_message(&self, _delete_handle: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

const ASYNC_PROJECT: &str = r#"
routes:
  ledger:
    target_hosts: [{host: "http://ledger"}]
  mailer:
    target_hosts: [{host: "http://mailer"}]
func_groups:
  orders:
    func_steps:
      book:
        route_name: ledger
        async: true
        async_message: '{"accepted": "{{.Vars.Vars.order}}"}'
        func_steps:
          notify:
            route_name: mailer
"#;

async fn deferred_id(harness: &Harness) -> String {
    let messages = harness.queue.poll(10).await.unwrap();
    assert_eq!(messages.len(), 1);
    messages[0].body.clone()
}

#[tokio::test]
async fn test_deferred_step_answers_with_placeholder() {
    let harness = Harness::new(ASYNC_PROJECT, MockBackend::new());

    let request = json_request(json!({"order": "A-1"})).with_header("X-Correlation-Id", "corr-9");
    let outcome = harness
        .engine
        .execute(CancellationToken::new(), request, "orders", None)
        .await
        .unwrap();

    assert_eq!(outcome.response.status, StatusCode::OK);
    assert_eq!(outcome.response.body_value(), json!({"accepted": "A-1"}));
    assert_eq!(harness.backend.call_count(), 0);

    let async_id = deferred_id(&harness).await;
    let row = harness.store.fetch(&async_id, None).await.unwrap().unwrap();
    assert_eq!(row.status, AsyncStatus::Pending);
    assert_eq!(row.pipeline_name, "orders");
    assert_eq!(row.step_key, "book");
    assert_eq!(row.correlation_id.as_deref(), Some("corr-9"));
}

#[tokio::test]
async fn test_resume_runs_step_and_children_once() {
    let harness = Harness::new(ASYNC_PROJECT, MockBackend::new());
    harness.run("orders", json!({"order": "A-1"})).await.unwrap();
    let async_id = deferred_id(&harness).await;

    let first = harness
        .engine
        .resume(CancellationToken::new(), &async_id)
        .await
        .unwrap();
    match &first {
        ResumeOutcome::Processed(response) => {
            assert_eq!(response.body_value(), json!({"order": "A-1"}))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(harness.backend.targets(), vec!["ledger", "mailer"]);

    let second = harness
        .engine
        .resume(CancellationToken::new(), &async_id)
        .await
        .unwrap();
    assert!(matches!(second, ResumeOutcome::Duplicate(AsyncStatus::Processed)));
    assert_eq!(harness.backend.call_count(), 2);

    let row = harness.store.fetch(&async_id, None).await.unwrap().unwrap();
    assert_eq!(row.status, AsyncStatus::Processed);
    assert!(row.result_json.is_some());
}

#[tokio::test]
async fn test_consume_drains_queue_and_marks_failures() {
    let backend = MockBackend::new().reply("ledger", |_| {
        Ok(json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"down": true})))
    });
    let harness = Harness::new(ASYNC_PROJECT, backend);
    harness.run("orders", json!({"order": "A-1"})).await.unwrap();
    harness.queue.publish("unknown-id").await.unwrap();

    let outcomes = harness
        .engine
        .consume(CancellationToken::new(), Some("jobs"), 10)
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|(_, outcome)| outcome.status() == AsyncStatus::Failed));
    // Failed rows are settled too, nothing is redelivered
    assert_eq!(harness.queue.len().await, 0);
    assert_eq!(harness.backend.targets(), vec!["ledger"]);
}

#[tokio::test]
async fn test_async_inside_loop_runs_synchronously() {
    let yaml = r#"
routes:
  ledger:
    target_hosts: [{host: "http://ledger"}]
func_groups:
  orders:
    func_steps:
      book:
        route_name: ledger
        loop_variable: "{{.Vars.Body.ids}}"
        async: true
        async_message: '{"accepted": true}'
"#;
    let harness = Harness::new(yaml, MockBackend::new());

    harness.run("orders", json!({"ids": [1, 2]})).await.unwrap();

    assert_eq!(harness.backend.call_count(), 2);
    assert_eq!(harness.queue.len().await, 0);
}

#[tokio::test]
async fn test_unknown_queue_withholds_placeholder() {
    let yaml = r#"
routes:
  ledger:
    target_hosts: [{host: "http://ledger"}]
func_groups:
  orders:
    func_steps:
      book:
        route_name: ledger
        async: true
        async_message: '{"accepted": true}'
        async_event_name: nowhere
"#;
    let harness = Harness::new(yaml, MockBackend::new());

    let response = harness.respond("orders", json!({})).await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.body_value()["error"]
        .as_str()
        .unwrap()
        .contains("nowhere"));
    assert_eq!(harness.store.len().await, 0);
}

#[tokio::test]
async fn test_empty_async_message_runs_synchronously() {
    let yaml = r#"
routes:
  ledger:
    target_hosts: [{host: "http://ledger"}]
func_groups:
  orders:
    func_steps:
      book:
        route_name: ledger
        async: true
        async_message: "{{.Vars.Vars.notify}}"
"#;
    let harness = Harness::new(yaml, MockBackend::new());

    let outcome = harness.run("orders", json!({"id": 1})).await.unwrap();

    assert_eq!(harness.backend.targets(), vec!["ledger"]);
    assert_eq!(outcome.response.body_value(), json!({"id": 1}));
    assert_eq!(harness.queue.len().await, 0);
    assert_eq!(harness.store.len().await, 0);
}

#[tokio::test]
async fn test_failed_publish_marks_row_failed() {
    let registry = ProjectConfig::from_yaml(ASYNC_PROJECT)
        .unwrap()
        .to_registry()
        .unwrap();
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(InMemoryAsyncStore::new());
    let engine = ExecutionEngine::new(
        registry,
        backend.clone(),
        store.clone(),
        QueueRegistry::new().with_queue(Arc::new(ClosedQueue)),
    );

    let response = engine
        .respond(
            CancellationToken::new(),
            json_request(json!({"order": "A-1"})),
            "orders",
            None,
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let body = response.body_value();
    assert!(body.get("accepted").is_none());
    assert!(body["error"].as_str().unwrap().contains("broker unavailable"));
    assert_eq!(backend.call_count(), 0);

    let rows = store.records().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, AsyncStatus::Failed);
    assert_eq!(rows[0].step_key, "book");
}
