//! HTTP surface over an in-memory index

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use chanidx::api::{create_router, AppState};
use chanidx::channels::SyncMetadataMapper;
use chanidx::index::{
    BucketStableSequence, ChangeIndex, ChangeNotifier, IndexKeys, IndexOptions, KvChangeIndex,
};
use chanidx::storage::memory::MemoryBucket;
use chanidx::Result;

async fn app(stable: u64) -> (Router, Arc<KvChangeIndex>) {
    let index = Arc::new(KvChangeIndex::new(
        Arc::new(MemoryBucket::new()),
        Arc::new(SyncMetadataMapper),
    ));
    index
        .init(
            0,
            Arc::new(move || -> Result<u64> { Ok(stable) }),
            ChangeNotifier::disconnected(),
            IndexOptions::for_testing(),
        )
        .await
        .unwrap();
    (create_router(AppState::new(index.clone(), "test-node")), index)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Node over a memory bucket that owns its stable sequence, wired like the binary
async fn writable_app() -> Router {
    let bucket = Arc::new(MemoryBucket::new());
    let options = IndexOptions::for_testing();
    let stable = Arc::new(BucketStableSequence::new(
        bucket.clone(),
        IndexKeys::new(options.key_prefix.clone()).stable_sequence_key(),
    ));
    let index = Arc::new(KvChangeIndex::new(bucket, Arc::new(SyncMetadataMapper)));
    index
        .init(0, stable.clone(), ChangeNotifier::disconnected(), options)
        .await
        .unwrap();
    create_router(AppState::new(index, "test-node").with_stable_writer(stable))
}

fn put_stable(stable: u64) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri("/v1/stable_sequence")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "stable_sequence": stable }).to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_doc(doc_id: &str, vb: u16, sequence: u64, channel: &str) -> Request<Body> {
    let mut channels = serde_json::Map::new();
    channels.insert(channel.to_string(), Value::Null);
    let body = json!({"_sync": {"rev": "1-a", "sequence": sequence, "channels": channels}});
    Request::builder()
        .method("POST")
        .uri(format!("/v1/docs/{}?vb={}", doc_id, vb))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (router, _) = app(0).await;
    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["node_id"], "test-node");
    assert_eq!(body["initialized"], true);
}

#[tokio::test]
async fn test_ingest_and_read_changes() {
    let (router, _) = app(100).await;

    for (doc, seq) in [("doc1", 3), ("doc2", 7), ("doc1", 12)] {
        let (status, _) = send(&router, post_doc(doc, 2, seq, "ABC")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, body) = send(&router, get("/v1/channels/ABC/changes?since=0")).await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["id"], "doc2");
    assert_eq!(results[1]["seq"], 12);
    assert_eq!(body["last_seq"], 12);

    let (_, body) = send(&router, get("/v1/channels/ABC/changes?since=7&limit=1")).await;
    assert_eq!(body["results"].as_array().unwrap().len(), 1);

    let (_, body) = send(&router, get("/v1/stable_sequence")).await;
    assert_eq!(body["stable_sequence"], 100);
}

#[tokio::test]
async fn test_cached_changes_without_snapshot() {
    let (router, index) = app(40).await;
    index.get_stable_sequence("").await;

    let (status, body) = send(&router, get("/v1/channels/ABC/cached_changes?since=0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid_from"], 41);
    assert!(body["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_bad_requests() {
    let (router, _) = app(10).await;

    let (status, _) = send(&router, get("/v1/channels/ABC/changes?since=abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, get("/v1/channels/a%20b/changes")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_toggle_indexing() {
    let (router, index) = app(100).await;

    let request = Request::builder()
        .method("PUT")
        .uri("/v1/indexing")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"enabled": false}"#))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert!(!index.is_indexing_enabled());

    send(&router, post_doc("doc1", 0, 5, "ABC")).await;
    let (_, body) = send(&router, get("/v1/channels/ABC/changes")).await;
    assert!(body["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_advancing_stable_sequence_exposes_changes() {
    let router = writable_app().await;

    for seq in 1..=5u64 {
        let (status, _) = send(&router, post_doc(&format!("doc{}", seq), 1, seq, "ABC")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    let (_, body) = send(&router, get("/v1/channels/ABC/changes?since=0")).await;
    assert!(body["results"].as_array().unwrap().is_empty());

    let (status, body) = send(&router, put_stable(5)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stable_sequence"], 5);

    let (_, body) = send(&router, get("/v1/channels/ABC/changes?since=0")).await;
    assert_eq!(body["results"].as_array().unwrap().len(), 5);

    // a lower value does not move the bound back
    let (_, body) = send(&router, put_stable(2)).await;
    assert_eq!(body["stable_sequence"], 5);
}

#[tokio::test]
async fn test_stable_sequence_is_read_only_without_writer() {
    let (router, _) = app(10).await;
    let (status, _) = send(&router, put_stable(50)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = send(&router, get("/v1/stable_sequence")).await;
    assert_eq!(body["stable_sequence"], 10);
}
