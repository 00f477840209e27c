use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::remote::{BatchOp, Document, DocumentStore, Query, UpdateOp};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/collections/{collection}", post(insert))
        .route(
            "/v1/collections/{collection}/{id}",
            get(fetch).patch(update).delete(remove),
        )
        .route("/v1/query", post(query))
        .route("/v1/watch", post(watch))
        .route("/v1/batch", post(batch))
}

// --- Handlers ---

async fn insert(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(data): Json<Value>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let id = state.documents.insert(&collection, data).await?;
    tracing::debug!("Inserted {}/{}", collection, id);
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn fetch(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> AppResult<Json<Document>> {
    state
        .documents
        .get(&collection, &id)
        .await?
        .map(Json)
        .ok_or(AppError::NotFound)
}

async fn update(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(ops): Json<Vec<UpdateOp>>,
) -> AppResult<StatusCode> {
    if ops.is_empty() {
        return Err(AppError::BadRequest("no update operations".into()));
    }
    state.documents.update(&collection, &id, ops).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    state.documents.delete(&collection, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn query(
    State(state): State<AppState>,
    Json(query): Json<Query>,
) -> AppResult<Json<Vec<Document>>> {
    Ok(Json(state.documents.query(&query).await?))
}

/// Server-sent events: one `data` frame per snapshot, `event: error` when the
/// subscription fails.
async fn watch(
    State(state): State<AppState>,
    Json(query): Json<Query>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    tracing::debug!("Watching {}", query.collection);
    let snapshots = state.documents.subscribe(query).await?;
    let events = snapshots.map(|snapshot| {
        let event = match snapshot {
            Ok(docs) => Event::default()
                .json_data(&docs)
                .unwrap_or_else(|e| error_event(&e.to_string())),
            Err(e) => {
                tracing::warn!("Subscription failed: {}", e);
                error_event(&e.to_string())
            }
        };
        Ok(event)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn error_event(message: &str) -> Event {
    Event::default().event("error").data(message)
}

async fn batch(
    State(state): State<AppState>,
    Json(ops): Json<Vec<BatchOp>>,
) -> AppResult<StatusCode> {
    state.documents.commit(ops).await?;
    Ok(StatusCode::NO_CONTENT)
}
