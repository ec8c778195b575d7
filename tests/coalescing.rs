//! Request deduplication and micro-batching through the client.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::{harness, test_config, Scripted};
use resilient_client::config::schema::BatchEndpoint;
use resilient_client::{ClientConfig, ErrorKind, Method, RequestDescriptor, Stage};

fn batched_config(window_ms: u64, cache_ttl_ms: u64) -> ClientConfig {
    let mut config = test_config();
    config.batch.window_ms = window_ms;
    config.batch.cache_ttl_ms = cache_ttl_ms;
    config.batch.endpoints.insert(
        "users".to_string(),
        BatchEndpoint {
            path: "/users/batch".to_string(),
            method: Method::Post,
        },
    );
    config
}

/// Answers a batch request with one `{"id": key}` object per key.
fn echo_keys(request: &resilient_client::transport::TransportRequest) -> Scripted {
    let body: Value = serde_json::from_slice(request.body.as_deref().unwrap_or(&b"{}"[..])).unwrap();
    let values: Vec<Value> = body["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| json!({ "id": k }))
        .collect();
    Scripted::Respond(200, Value::Array(values).to_string())
}

fn user(key: &str) -> RequestDescriptor {
    RequestDescriptor::get("users", format!("/users/{}", key)).with_batch_key(key)
}

#[tokio::test]
async fn test_identical_gets_share_one_call() {
    let h = harness(test_config()).await;
    h.transport.set_delay(Duration::from_millis(50));
    h.transport.respond_with(200, r#"{"id": 1}"#);

    let first = RequestDescriptor::get("users", "/users/1");
    let second = RequestDescriptor::get("users", "/users/1");
    let (a, b) = tokio::join!(h.client.execute(first), h.client.execute(second));

    let a = a.unwrap().into_response().unwrap();
    let b = b.unwrap().into_response().unwrap();
    assert_eq!(a.body, b.body);
    assert_eq!(h.transport.calls(), 1);

    // Once settled the next identical call goes out again.
    h.client.execute(RequestDescriptor::get("users", "/users/1")).await.unwrap();
    assert_eq!(h.transport.calls(), 2);
}

#[tokio::test]
async fn test_shared_failure_reaches_every_caller() {
    let h = harness(test_config()).await;
    h.transport.set_delay(Duration::from_millis(50));
    h.transport.respond_with(404, "");

    let first = RequestDescriptor::get("users", "/users/9");
    let second = RequestDescriptor::get("users", "/users/9");
    let second_id = second.id;
    let (a, b) = tokio::join!(h.client.execute(first), h.client.execute(second));

    assert!(matches!(a.unwrap_err().kind, ErrorKind::HttpStatus { status: 404, .. }));
    let b = b.unwrap_err();
    assert!(matches!(b.kind, ErrorKind::HttpStatus { status: 404, .. }));
    assert_eq!(b.request_id, second_id);
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn test_different_versions_are_not_coalesced() {
    let h = harness(test_config()).await;
    h.transport.set_delay(Duration::from_millis(50));
    h.transport.handle_with(|request| {
        let version = request.headers.get("api-version").cloned().unwrap_or_default();
        Scripted::Respond(200, json!({ "served": version }).to_string())
    });

    let (v1, v2) = tokio::join!(
        h.client.execute(RequestDescriptor::get("users", "/users/1").with_version("1")),
        h.client.execute(RequestDescriptor::get("users", "/users/1").with_version("2")),
    );
    let served = |outcome: resilient_client::ServiceResult<resilient_client::ExecuteOutcome>| {
        outcome.unwrap().into_response().unwrap().json::<Value>().unwrap()["served"].clone()
    };
    assert_eq!(served(v1), json!("1"));
    assert_eq!(served(v2), json!("2"));
    assert_eq!(h.transport.calls(), 2);
}

#[tokio::test]
async fn test_different_credentials_are_not_coalesced() {
    let h = harness(test_config()).await;
    h.transport.set_delay(Duration::from_millis(50));

    let as_user = |token: &str| {
        RequestDescriptor::get("users", "/me").with_header("authorization", format!("Bearer {}", token))
    };
    let (a, b, c) = tokio::join!(
        h.client.execute(as_user("alice")),
        h.client.execute(as_user("bob")),
        h.client.execute(as_user("alice")),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(h.transport.calls(), 2);
}

#[tokio::test]
async fn test_posts_coalesce_only_with_idempotency_key() {
    let h = harness(test_config()).await;
    h.transport.set_delay(Duration::from_millis(50));

    let body = json!({"amount": 10});
    let (a, b) = tokio::join!(
        h.client.execute(RequestDescriptor::post("billing", "/charges", body.clone())),
        h.client.execute(RequestDescriptor::post("billing", "/charges", body.clone())),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.transport.calls(), 2);

    let (a, b) = tokio::join!(
        h.client.execute(
            RequestDescriptor::post("billing", "/charges", body.clone()).with_idempotency_key("charge-1")
        ),
        h.client.execute(
            RequestDescriptor::post("billing", "/charges", body.clone()).with_idempotency_key("charge-1")
        ),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.transport.calls(), 3);
}

#[tokio::test]
async fn test_batch_window_collects_keys_into_one_call() {
    let h = harness(batched_config(20, 0)).await;
    h.transport.handle_with(echo_keys);

    let (a, b, c) = tokio::join!(
        h.client.execute(user("1")),
        h.client.execute(user("2")),
        h.client.execute(user("1")),
    );
    let value = |outcome: resilient_client::ServiceResult<resilient_client::ExecuteOutcome>| {
        outcome.unwrap().into_response().unwrap().json::<Value>().unwrap()
    };
    assert_eq!(value(a), json!({"id": "1"}));
    assert_eq!(value(b), json!({"id": "2"}));
    assert_eq!(value(c), json!({"id": "1"}));

    assert_eq!(h.transport.calls(), 1);
    let request = &h.transport.requests()[0];
    assert!(request.url.ends_with("/users/batch"));
    assert_eq!(h.transport.bodies()[0], json!({"keys": ["1", "2"]}));
}

#[tokio::test]
async fn test_batch_failure_reaches_every_waiter() {
    let h = harness(batched_config(20, 0)).await;
    h.transport.respond_with(500, "boom");

    let (a, b) = tokio::join!(h.client.execute(user("1")), h.client.execute(user("2")));
    for result in [a, b] {
        let err = result.unwrap_err();
        assert_eq!(err.stage, Stage::Batch);
        assert!(matches!(err.kind, ErrorKind::HttpStatus { status: 500, .. }));
    }
    assert_eq!(h.transport.calls(), 1);

    // Failures are not cached.
    h.transport.handle_with(echo_keys);
    let response = h.client.execute(user("1")).await.unwrap().into_response().unwrap();
    assert_eq!(response.json::<Value>().unwrap(), json!({"id": "1"}));
}

#[tokio::test]
async fn test_batch_length_mismatch_is_a_decode_error() {
    let h = harness(batched_config(5, 0)).await;
    h.transport.respond_with(200, r#"[{"id": "1"}]"#);

    let (a, b) = tokio::join!(h.client.execute(user("1")), h.client.execute(user("2")));
    assert!(matches!(a.unwrap_err().kind, ErrorKind::Decode(_)));
    assert!(matches!(b.unwrap_err().kind, ErrorKind::Decode(_)));
}

#[tokio::test]
async fn test_batch_results_cached_until_ttl() {
    let h = harness(batched_config(5, 1_000)).await;
    h.transport.handle_with(echo_keys);

    h.client.execute(user("1")).await.unwrap();
    h.client.execute(user("1")).await.unwrap();
    assert_eq!(h.transport.calls(), 1);

    h.clock.set(1_000);
    h.client.execute(user("1")).await.unwrap();
    assert_eq!(h.transport.calls(), 2);

    assert!(h.client.invalidate_batch_key("1"));
    assert!(!h.client.invalidate_batch_key("1"));
    h.client.execute(user("1")).await.unwrap();
    assert_eq!(h.transport.calls(), 3);
}

#[tokio::test]
async fn test_cancelled_key_is_withdrawn_from_batch() {
    let h = harness(batched_config(50, 0)).await;
    h.transport.handle_with(echo_keys);

    let cancel = CancellationToken::new();
    let cancelled = {
        let client = h.client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.execute_with_cancel(user("7"), cancel).await })
    };
    let kept = {
        let client = h.client.clone();
        tokio::spawn(async move { client.execute(user("8")).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let err = cancelled.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert!(kept.await.unwrap().is_ok());
    assert_eq!(h.transport.calls(), 1);
    assert_eq!(h.transport.bodies()[0], json!({"keys": ["8"]}));
}
