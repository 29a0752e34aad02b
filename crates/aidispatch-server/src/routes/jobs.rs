//! Job intake and status routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::debug;

use aidispatch_core::JobNotification;

use super::error_response;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/{task_id}", get(get_job))
        .route("/status", get(get_status))
}

/// POST /api/jobs: enqueue a job; the outcome goes to the callback host.
async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(job): Json<JobNotification>,
) -> Response {
    let task_id = job.task_id;
    debug!("Job {} received for {} {}", task_id, job.pipeline, job.model_id);
    match state.dispatcher.submit(job) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "taskId": task_id, "state": "received" })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/jobs: tracked jobs, newest first.
async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let jobs = state.dispatcher.jobs();
    Json(serde_json::json!({
        "total": jobs.len(),
        "jobs": jobs,
    }))
}

/// GET /api/jobs/{task_id}: a single job.
async fn get_job(State(state): State<Arc<AppState>>, Path(task_id): Path<u64>) -> impl IntoResponse {
    match state.dispatcher.job(task_id) {
        Some(job) => (StatusCode::OK, Json(serde_json::json!(job))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Job not found" })),
        ),
    }
}

/// GET /api/status: queue depth, running jobs, remaining capacity.
async fn get_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.dispatcher.status()))
}
