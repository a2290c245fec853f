//! Sibling fan-in

use crate::helpers::*;
use http::{HeaderMap, StatusCode};
use funcflow::http::HttpResponse;
use serde_json::json;

const SIBLINGS: &str = r#"
routes:
  users:
    target_hosts: [{host: "http://users"}]
  orders:
    target_hosts: [{host: "http://orders"}]
  avatar:
    target_hosts: [{host: "http://avatar"}]
func_groups:
  profile:
    func_steps:
      a_users:
        route_name: users
      b_orders:
        route_name: orders
  single:
    func_steps:
      only:
        route_name: users
  picture:
    func_steps:
      only:
        route_name: avatar
"#;

#[tokio::test]
async fn test_single_branch_is_not_wrapped() {
    let backend = MockBackend::new().reply("users", |_| {
        Ok(json_response(StatusCode::OK, json!([{"id": 1}])))
    });
    let harness = Harness::new(SIBLINGS, backend);

    let outcome = harness.run("single", json!({})).await.unwrap();

    assert_eq!(outcome.response.body_value(), json!([{"id": 1}]));
}

#[tokio::test]
async fn test_siblings_merge_into_array() {
    let backend = MockBackend::new()
        .reply("users", |_| Ok(json_response(StatusCode::OK, json!([{"id": 1}]))))
        .reply("orders", |_| {
            Ok(json_response(StatusCode::CREATED, json!({"orders": 3})))
        });
    let harness = Harness::new(SIBLINGS, backend);

    let outcome = harness.run("profile", json!({})).await.unwrap();

    // Singleton arrays collapse; the last branch's status wins
    assert_eq!(
        outcome.response.body_value(),
        json!([{"id": 1}, {"orders": 3}])
    );
    assert_eq!(outcome.response.status, StatusCode::CREATED);
    assert_eq!(outcome.vars.unwrap().body, json!([{"id": 1}, {"orders": 3}]));
    assert!(outcome.scopes.res_vars.contains_key("a_users"));
    assert!(outcome.scopes.res_vars.contains_key("b_orders"));
}

#[tokio::test]
async fn test_opaque_single_response_passes_through() {
    let backend = MockBackend::new().reply("avatar", |_| {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "image/png".parse().unwrap());
        Ok(HttpResponse::new(StatusCode::OK, headers, vec![0x89u8, b'P', b'N', b'G']))
    });
    let harness = Harness::new(SIBLINGS, backend);

    let outcome = harness.run("picture", json!({})).await.unwrap();

    assert_eq!(outcome.response.header("content-type"), Some("image/png"));
    assert_eq!(&outcome.response.body[..], &[0x89u8, b'P', b'N', b'G'][..]);
}
