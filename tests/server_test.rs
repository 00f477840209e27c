use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use umuw::config::Config;
use umuw::db;
use umuw::routes;
use umuw::state::AppState;
use umuw::storage::UploadDir;

fn app(tmp: &TempDir) -> Router {
    let pool = db::create_pool(&tmp.path().join("server.db")).unwrap();
    db::run_migrations(&pool).unwrap();
    let uploads = UploadDir::new(tmp.path().join("uploads")).unwrap();
    routes::router(AppState::new(pool, Config::default(), uploads))
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let tmp = TempDir::new().unwrap();
    let response = app(&tmp).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn document_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let app = app(&tmp);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/collections/posts",
            json!({ "page": "daily", "text": "hello", "comments": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let id = body_json(response).await["id"]
        .as_str()
        .unwrap()
        .to_string();
    let doc_uri = format!("/v1/collections/posts/{}", id);

    let response = app.clone().oneshot(get(&doc_uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    assert_eq!(doc["id"], id.as_str());
    assert_eq!(doc["data"]["text"], "hello");

    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &doc_uri,
            json!([{ "op": "arrayUnion", "field": "comments", "values": [{ "text": "hi" }] }]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/query",
            json!({ "collection": "posts", "filters": [{ "field": "page", "value": "daily" }] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let docs = body_json(response).await;
    assert_eq!(docs.as_array().unwrap().len(), 1);
    assert_eq!(docs[0]["data"]["comments"][0]["text"], "hi");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(&doc_uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.oneshot(get(&doc_uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_patch_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let response = app(&tmp)
        .oneshot(json_request("PATCH", "/v1/collections/posts/x", json!([])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn patch_of_missing_document_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let response = app(&tmp)
        .oneshot(json_request(
            "PATCH",
            "/v1/collections/posts/missing",
            json!([{ "op": "set", "field": "text", "value": "x" }]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_of_missing_document_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let response = app(&tmp)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/v1/collections/posts/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_batch_assertion_is_a_conflict_and_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let app = app(&tmp);

    let seed = json!([
        { "op": "set", "collection": "users", "id": "alice", "data": { "username": "alice" } }
    ]);
    let response = app
        .clone()
        .oneshot(json_request("POST", "/v1/batch", seed))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let racing = json!([
        { "op": "set", "collection": "pendingUsers", "id": "alice", "data": { "username": "alice" } },
        { "op": "assertAbsent", "collection": "users", "id": "alice" }
    ]);
    let response = app
        .clone()
        .oneshot(json_request("POST", "/v1/batch", racing))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .oneshot(get("/v1/collections/pendingUsers/alice"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn uploads_are_stored_and_served() {
    let tmp = TempDir::new().unwrap();
    let app = app(&tmp);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/uploads?name=cat.png")
                .header(header::CONTENT_TYPE, "image/png")
                .body(Body::from(&b"\x89PNG"[..]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let url = body_json(response).await["url"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(url.starts_with("/uploads/"));
    assert!(url.ends_with("-cat.png"));

    let response = app.oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), b"\x89PNG");
}

#[tokio::test]
async fn empty_upload_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let response = app(&tmp)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/uploads?name=a.png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn hidden_or_missing_uploads_are_not_found() {
    let tmp = TempDir::new().unwrap();
    let app = app(&tmp);
    std::fs::write(tmp.path().join("uploads").join(".secret"), b"x").unwrap();

    let response = app.clone().oneshot(get("/uploads/.secret")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(get("/uploads/nothing.png")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
