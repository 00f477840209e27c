use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/uploads", post(upload))
        .route("/uploads/{name}", get(serve))
}

#[derive(Deserialize)]
struct UploadParams {
    name: Option<String>,
}

async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<Value>)> {
    if body.is_empty() {
        return Err(AppError::BadRequest("empty upload".into()));
    }
    let name = params.name.as_deref().unwrap_or("upload");
    let stored = state.uploads.store(name, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "url": format!("/uploads/{}", stored) })),
    ))
}

pub async fn serve(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(path) = state.uploads.resolve(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, mime.as_ref().to_string()),
                    (header::CACHE_CONTROL, "public, max-age=86400".to_string()),
                ],
                bytes,
            )
                .into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
