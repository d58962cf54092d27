//! End-to-end tests for the aggregator receiver, driven in-process.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Request, StatusCode};
use axum::Router;
use fanin_engine::{Barrier, Retention};
use fanin_server::cloudevent::STRUCTURED_CONTENT_TYPE;
use fanin_server::{build_router, AppState, MergeMode, Shutdown};
use fanin_store::{
    Arrival, BarrierStore, Combine, Concat, Contribution, CorruptStatePolicy, FileBarrierStore,
    MemoryBarrierStore, Snapshot, StoreError,
};
use serde_json::{json, Value};
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    app: Router,
    shutdown: Arc<Shutdown>,
}

fn harness(
    store: Arc<dyn BarrierStore>,
    combine: Arc<dyn Combine>,
    width: i64,
    retention: Retention,
    type_override: Option<&str>,
) -> Harness {
    let shutdown = Arc::new(Shutdown::new());
    let barrier = Barrier::new(store, combine, width)
        .unwrap()
        .with_retention(retention);
    let app = build_router(AppState {
        barrier,
        merge_mode: MergeMode::Message,
        type_override: type_override.map(str::to_string),
        default_run_id: "event".to_string(),
        shutdown: shutdown.clone(),
    });
    Harness { app, shutdown }
}

fn binary_event(id: &str, run_id: Option<&str>, data: Value) -> Request<Body> {
    let mut builder = Request::post("/")
        .header("ce-id", id)
        .header("ce-source", "/funcs/test")
        .header("ce-type", "dev.fanin.part")
        .header("ce-specversion", "1.0")
        .header("ce-time", "2026-10-16T09:30:00Z")
        .header(CONTENT_TYPE, "application/json");
    if let Some(run_id) = run_id {
        builder = builder.header("ce-runid", run_id);
    }
    builder
        .body(Body::from(serde_json::to_vec(&data).unwrap()))
        .unwrap()
}

fn message(id: i64, text: &str) -> Value {
    json!({"id": id, "message": text})
}

struct Reply {
    status: StatusCode,
    headers: axum::http::HeaderMap,
    body: Vec<u8>,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

async fn send(app: &Router, request: Request<Body>) -> Reply {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    Reply {
        status,
        headers,
        body,
    }
}

// =========================================================================
// Collection-backed
// =========================================================================

#[tokio::test]
async fn forwards_single_merged_event_after_all_parts() {
    let store = Arc::new(MemoryBarrierStore::new());
    let h = harness(
        store.clone(),
        Arc::new(Concat::default()),
        3,
        Retention::Delete,
        Some("dev.fanin.merged"),
    );

    let a = send(&h.app, binary_event("e1", None, message(1, "a"))).await;
    assert_eq!(a.status, StatusCode::OK);
    assert!(a.body.is_empty());

    let b = send(&h.app, binary_event("e2", None, message(2, "b"))).await;
    assert_eq!(b.status, StatusCode::OK);
    assert!(b.body.is_empty());

    let c = send(&h.app, binary_event("e3", None, message(3, "c"))).await;
    assert_eq!(c.status, StatusCode::OK);
    assert_eq!(c.headers["ce-type"], "dev.fanin.merged");
    assert_eq!(c.headers["ce-id"], "e3");
    assert_eq!(c.headers["ce-source"], "/funcs/test");
    assert_eq!(c.json(), json!({"id": 3, "message": "abc"}));

    assert!(store.run_ids().await.is_empty());

    // With no active run, the next delivery opens a new one.
    let d = send(&h.app, binary_event("e4", None, message(4, "d"))).await;
    assert_eq!(d.status, StatusCode::OK);
    assert!(d.body.is_empty());
    assert_eq!(store.snapshot("event").await.unwrap().count, 1);
}

#[tokio::test]
async fn type_is_kept_without_override() {
    let h = harness(
        Arc::new(MemoryBarrierStore::new()),
        Arc::new(Concat::default()),
        1,
        Retention::Delete,
        None,
    );
    let reply = send(&h.app, binary_event("e1", None, message(1, "a"))).await;
    assert_eq!(reply.headers["ce-type"], "dev.fanin.part");
}

#[tokio::test]
async fn structured_request_gets_structured_reply() {
    let h = harness(
        Arc::new(MemoryBarrierStore::new()),
        Arc::new(Concat::default()),
        1,
        Retention::Delete,
        None,
    );
    let event = json!({
        "id": "s1",
        "source": "/funcs/s",
        "type": "dev.fanin.part",
        "specversion": "1.0",
        "runid": "structured-run",
        "datacontenttype": "application/json",
        "data": {"id": 1, "message": "solo"}
    });
    let request = Request::post("/")
        .header(CONTENT_TYPE, STRUCTURED_CONTENT_TYPE)
        .body(Body::from(serde_json::to_vec(&event).unwrap()))
        .unwrap();

    let reply = send(&h.app, request).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers[CONTENT_TYPE], STRUCTURED_CONTENT_TYPE);
    let out = reply.json();
    assert_eq!(out["id"], "s1");
    assert_eq!(out["runid"], "structured-run");
    assert_eq!(out["data"], json!({"id": 1, "message": "solo"}));
}

#[tokio::test]
async fn malformed_data_is_rejected_and_not_stored() {
    let store = Arc::new(MemoryBarrierStore::new());
    let h = harness(
        store.clone(),
        Arc::new(Concat::default()),
        2,
        Retention::Delete,
        None,
    );

    let reply = send(&h.app, binary_event("bad", None, json!({"message": 42}))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert!(reply.json()["error"].is_string());
    assert!(store.run_ids().await.is_empty());
}

#[tokio::test]
async fn missing_envelope_attributes_are_rejected() {
    let h = harness(
        Arc::new(MemoryBarrierStore::new()),
        Arc::new(Concat::default()),
        2,
        Retention::Delete,
        None,
    );
    let request = Request::post("/")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"id":1,"message":"a"}"#))
        .unwrap();

    let reply = send(&h.app, request).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn redelivered_event_does_not_count_twice() {
    let store = Arc::new(MemoryBarrierStore::new());
    let h = harness(
        store.clone(),
        Arc::new(Concat::default()),
        2,
        Retention::Delete,
        None,
    );

    send(&h.app, binary_event("same", None, message(1, "a"))).await;
    let again = send(&h.app, binary_event("same", None, message(1, "a"))).await;
    assert_eq!(again.status, StatusCode::OK);
    assert!(again.body.is_empty());
    assert_eq!(store.snapshot("event").await.unwrap().count, 1);
}

#[tokio::test]
async fn event_redelivered_after_completion_opens_no_run() {
    let store = Arc::new(MemoryBarrierStore::new());
    let h = harness(
        store.clone(),
        Arc::new(Concat::default()),
        2,
        Retention::Delete,
        None,
    );

    send(&h.app, binary_event("e1", None, message(1, "a"))).await;
    let done = send(&h.app, binary_event("e2", None, message(2, "b"))).await;
    assert_eq!(done.json(), json!({"id": 2, "message": "ab"}));

    let late = send(&h.app, binary_event("e1", None, message(1, "a"))).await;
    assert_eq!(late.status, StatusCode::OK);
    assert!(late.body.is_empty());
    assert!(store.run_ids().await.is_empty());

    send(&h.app, binary_event("e3", None, message(3, "c"))).await;
    let next = send(&h.app, binary_event("e4", None, message(4, "d"))).await;
    assert_eq!(next.json(), json!({"id": 2, "message": "cd"}));
}

#[tokio::test]
async fn completing_event_redelivered_to_retained_run_is_forwarded_again() {
    let h = harness(
        Arc::new(MemoryBarrierStore::new()),
        Arc::new(Concat::default()),
        2,
        Retention::Retain,
        Some("dev.fanin.merged"),
    );

    send(&h.app, binary_event("e1", None, message(1, "a"))).await;
    let done = send(&h.app, binary_event("e2", None, message(2, "b"))).await;
    let again = send(&h.app, binary_event("e2", None, message(2, "b"))).await;

    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.headers["ce-type"], "dev.fanin.merged");
    assert_eq!(again.headers["ce-id"], "e2");
    assert_eq!(again.json(), done.json());
    assert_eq!(again.json(), json!({"id": 2, "message": "ab"}));
}

#[tokio::test]
async fn delivery_past_width_on_retained_run_conflicts() {
    let h = harness(
        Arc::new(MemoryBarrierStore::new()),
        Arc::new(Concat::default()),
        1,
        Retention::Retain,
        None,
    );

    let first = send(&h.app, binary_event("e1", None, message(1, "a"))).await;
    assert_eq!(first.json(), json!({"id": 1, "message": "a"}));

    let extra = send(&h.app, binary_event("e2", None, message(2, "b"))).await;
    assert_eq!(extra.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn run_id_extension_keeps_runs_apart() {
    let store = Arc::new(MemoryBarrierStore::new());
    let h = harness(
        store.clone(),
        Arc::new(Concat::default()),
        2,
        Retention::Delete,
        None,
    );

    send(&h.app, binary_event("a1", Some("run-a"), message(1, "a"))).await;
    send(&h.app, binary_event("b1", Some("run-b"), message(1, "b"))).await;
    let done = send(&h.app, binary_event("a2", Some("run-a"), message(2, "A"))).await;

    assert_eq!(done.json(), json!({"id": 2, "message": "aA"}));
    assert_eq!(done.headers["ce-runid"], "run-a");
    assert_eq!(store.run_ids().await, vec!["run-b".to_string()]);
}

#[tokio::test]
async fn health_is_ok() {
    let h = harness(
        Arc::new(MemoryBarrierStore::new()),
        Arc::new(Concat::default()),
        1,
        Retention::Delete,
        None,
    );
    let reply = send(&h.app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, b"ok");
}

// =========================================================================
// File-backed
// =========================================================================

#[tokio::test]
async fn file_backed_run_from_x_to_x_y() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("event.json");
    let store = FileBarrierStore::open(dir.path(), Concat::spaced()).unwrap();
    let h = harness(
        Arc::new(store),
        Arc::new(Concat::spaced()),
        2,
        Retention::Delete,
        None,
    );

    let x = send(&h.app, binary_event("x", None, message(1, "x"))).await;
    assert_eq!(x.status, StatusCode::OK);
    assert!(x.body.is_empty());
    let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(on_disk["id"], 1);
    assert_eq!(on_disk["message"], "x");

    let y = send(&h.app, binary_event("y", None, message(1, "y"))).await;
    assert_eq!(y.status, StatusCode::OK);
    assert_eq!(y.json(), json!({"id": 2, "message": "x y"}));
    assert!(!path.exists());
}

#[tokio::test]
async fn corrupt_state_under_fail_policy_stops_the_server() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("event.json"), b"garbage").unwrap();
    let store = FileBarrierStore::open(dir.path(), Concat::spaced())
        .unwrap()
        .with_policy(CorruptStatePolicy::Fail);
    let h = harness(
        Arc::new(store),
        Arc::new(Concat::spaced()),
        2,
        Retention::Delete,
        None,
    );

    let reply = send(&h.app, binary_event("x", None, message(1, "x"))).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(h.shutdown.is_fatal());
}

#[tokio::test]
async fn corrupt_state_under_reset_policy_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("event.json"), b"garbage").unwrap();
    let store = FileBarrierStore::open(dir.path(), Concat::spaced()).unwrap();
    let h = harness(
        Arc::new(store),
        Arc::new(Concat::spaced()),
        1,
        Retention::Delete,
        None,
    );

    let reply = send(&h.app, binary_event("x", None, message(1, "x"))).await;
    assert_eq!(reply.json(), json!({"id": 1, "message": "x"}));
    assert!(!h.shutdown.is_fatal());
}

// =========================================================================
// Store failures
// =========================================================================

struct UnreachableStore;

#[async_trait]
impl BarrierStore for UnreachableStore {
    async fn append(&self, _: &str, _: i64, _: Contribution) -> Result<Arrival, StoreError> {
        Err(StoreError::Io(std::io::Error::other("connection refused")))
    }

    async fn snapshot(&self, _: &str) -> Result<Snapshot, StoreError> {
        Err(StoreError::Io(std::io::Error::other("connection refused")))
    }

    async fn clear(&self, _: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn steady_state_store_failure_reports_incomplete() {
    let h = harness(
        Arc::new(UnreachableStore),
        Arc::new(Concat::default()),
        2,
        Retention::Delete,
        None,
    );

    let reply = send(&h.app, binary_event("e1", None, message(1, "a"))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.body.is_empty());
    assert!(!h.shutdown.is_fatal());
}
