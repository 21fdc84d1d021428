//! HTTP request handlers.

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::AppState;
use crate::aggregator::AggregateError;

/// Health check endpoint for container orchestration.
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct CountParams {
    pub url: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Number of annotations on a URL visible to the caller.
///
/// The `Authorization` header, if any, is forwarded to the identity
/// provider unchanged.
pub async fn count(
    State(state): State<AppState>,
    Query(params): Query<CountParams>,
    headers: HeaderMap,
) -> Response {
    let Some(url) = params.url.filter(|u| !u.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing required parameter \"url\"");
    };
    let auth = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    match state.aggregator.fetch_count(&url, auth).await {
        Ok(count) => Json(json!({ "count": count })).into_response(),
        Err(e @ AggregateError::Identity(_)) => {
            warn!("Count for {} failed: {}", url, e);
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(e @ AggregateError::Store(_)) => {
            warn!("Count for {} failed: {}", url, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Remove an annotation from the index.
pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.indexer.remove_annotation(&id).await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => {
            warn!("Removing annotation {} failed: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
