//! HTTP route handlers.

pub mod jobs;
pub mod results;
pub mod workers;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use aidispatch_core::Error;

use crate::state::AppState;

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .merge(results::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(jobs::routes())
        .merge(workers::routes())
}

/// JSON error body with a status derived from the error kind.
pub(crate) fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::QueueFull | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        Error::Json(_) | Error::Validation { .. } => StatusCode::BAD_REQUEST,
        Error::DuplicateTask(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
