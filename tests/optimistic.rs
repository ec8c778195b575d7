//! Optimistic mutations through the client.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{harness, test_config, ScriptedTransport};
use resilient_client::clock::ManualClock;
use resilient_client::optimistic::{shallow_merge, ConflictStrategy, MergeFn, MutationStatus};
use resilient_client::{
    Client, ErrorKind, Method, MutationOutcome, RequestDescriptor, Stage,
};

fn rename(name: &str) -> RequestDescriptor {
    RequestDescriptor::new("users", Method::Put, "/users/1").with_body(json!({ "name": name }))
}

#[tokio::test]
async fn test_failed_mutation_restores_snapshot() {
    let h = harness(test_config()).await;
    h.client.state().set("user:1", json!({"name": "A"}));
    h.transport.set_delay(Duration::from_millis(50));
    h.transport.respond_with(400, r#"{"error": "name taken"}"#);

    let task = {
        let client = h.client.clone();
        tokio::spawn(async move {
            client
                .mutate("user:1", json!({"name": "B"}), rename("B"), ConflictStrategy::ClientWins)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.client.state().get("user:1"), Some(json!({"name": "B"})));

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err.kind, ErrorKind::HttpStatus { status: 400, .. }));
    assert_eq!(h.client.state().get("user:1"), Some(json!({"name": "A"})));
    assert_eq!(h.client.mutations().pending_on("user:1"), 0);
}

#[tokio::test]
async fn test_rollback_of_first_write_removes_key() {
    let h = harness(test_config()).await;
    h.transport.respond_with(500, "");

    let result = h
        .client
        .mutate("user:2", json!({"name": "new"}), rename("new"), ConflictStrategy::ClientWins)
        .await;
    assert!(result.is_err());
    assert_eq!(h.client.state().get("user:2"), None);
}

#[tokio::test]
async fn test_commit_adopts_server_value() {
    let h = harness(test_config()).await;
    h.client.state().set("user:1", json!({"name": "A"}));
    h.transport.respond_with(200, r#"{"name": "B", "version": 2}"#);

    let outcome = h
        .client
        .mutate("user:1", json!({"name": "B"}), rename("B"), ConflictStrategy::ClientWins)
        .await
        .unwrap();
    match outcome {
        MutationOutcome::Committed { context, response } => {
            assert_eq!(context.status, MutationStatus::Committed);
            assert_eq!(context.previous_snapshot, Some(json!({"name": "A"})));
            assert_eq!(response.status, 200);
        }
        other => panic!("expected a committed mutation, got {:?}", other),
    }
    assert_eq!(
        h.client.state().get("user:1"),
        Some(json!({"name": "B", "version": 2}))
    );

    assert_eq!(h.transport.requests().len(), 1);
}

#[tokio::test]
async fn test_queued_mutation_commits_on_replay() {
    let h = harness(test_config()).await;
    h.client.state().set("user:1", json!({"name": "A"}));
    h.connectivity.set_online(false);

    let outcome = h
        .client
        .mutate("user:1", json!({"name": "B"}), rename("B"), ConflictStrategy::ClientWins)
        .await
        .unwrap();
    let entry_id = match outcome {
        MutationOutcome::Pending { entry_id, context } => {
            assert_eq!(context.status, MutationStatus::Pending);
            entry_id
        }
        other => panic!("expected a pending mutation, got {:?}", other),
    };
    assert_eq!(h.client.state().get("user:1"), Some(json!({"name": "B"})));
    assert_eq!(
        h.client.queue_entries()[0].request.target_key.as_deref(),
        Some("user:1")
    );

    h.connectivity.set_online(true);
    h.transport.respond_with(200, r#"{"name": "B", "version": 7}"#);
    let report = h.client.process_queue().await.unwrap();
    assert_eq!(report.replayed, vec![entry_id]);
    assert_eq!(
        h.client.state().get("user:1"),
        Some(json!({"name": "B", "version": 7}))
    );
    assert_eq!(h.client.mutations().pending_on("user:1"), 0);
}

#[tokio::test]
async fn test_dead_lettered_mutation_rolls_back() {
    let h = harness(test_config()).await;
    h.client.state().set("user:1", json!({"name": "A"}));
    h.connectivity.set_online(false);

    h.client
        .mutate("user:1", json!({"name": "B"}), rename("B"), ConflictStrategy::ClientWins)
        .await
        .unwrap();

    h.connectivity.set_online(true);
    h.transport.respond_with(422, "");
    let report = h.client.process_queue().await.unwrap();
    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(h.client.state().get("user:1"), Some(json!({"name": "A"})));
}

#[tokio::test]
async fn test_merge_without_merge_fn_is_a_conflict() {
    let h = harness(test_config()).await;
    h.transport.set_delay(Duration::from_millis(50));
    h.client.state().set("doc:1", json!({"title": "x"}));

    let first = {
        let client = h.client.clone();
        tokio::spawn(async move {
            let request = RequestDescriptor::new("docs", Method::Patch, "/docs/1");
            client
                .mutate("doc:1", json!({"title": "y"}), request, ConflictStrategy::Merge)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let request = RequestDescriptor::new("docs", Method::Patch, "/docs/1");
    let err = h
        .client
        .mutate("doc:1", json!({"body": "z"}), request, ConflictStrategy::Merge)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict("doc:1".to_string()));
    assert_eq!(err.stage, Stage::Mutation);

    assert!(first.await.unwrap().is_ok());
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_merges_combine_fields() {
    let transport = ScriptedTransport::new();
    transport.set_delay(Duration::from_millis(50));
    transport.respond_with(200, "");
    let client = Client::builder(test_config())
        .transport(transport.clone())
        .clock(Arc::new(ManualClock::new(0)))
        .merge_fn(Arc::new(shallow_merge) as MergeFn)
        .build()
        .await
        .unwrap();
    client.state().set("user:1", json!({"name": "A", "age": 1}));

    let spawn_mutation = |speculative: serde_json::Value| {
        let client = client.clone();
        tokio::spawn(async move {
            let request = RequestDescriptor::new("users", Method::Patch, "/users/1")
                .with_body(speculative.clone());
            client
                .mutate("user:1", speculative, request, ConflictStrategy::Merge)
                .await
        })
    };
    let a = spawn_mutation(json!({"name": "B"}));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b = spawn_mutation(json!({"age": 2}));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(client.state().get("user:1"), Some(json!({"name": "B", "age": 2})));
    assert_eq!(client.mutations().pending_on("user:1"), 2);

    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    assert_eq!(client.mutations().pending_on("user:1"), 0);
    assert_eq!(transport.calls(), 2);
}
