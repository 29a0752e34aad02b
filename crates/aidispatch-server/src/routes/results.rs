//! Inbound remote results callback.
//!
//! Remote workers may return a result over HTTP instead of their socket,
//! using the same header contract the node uses for its own deliveries.

use std::sync::Arc;

use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use tracing::{debug, warn};

use aidispatch_remote::Completion;
use aidispatch_runtime::transport::{
    CREDENTIALS_HEADER, ERROR_CONTENT_TYPE, PROTOCOL_VERSION, RESULTS_PART, RESULTS_PATH,
    TASK_ID_HEADER,
};

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route(RESULTS_PATH, post(post_results))
}

fn reject(status: StatusCode, msg: &str) -> Response {
    (status, Json(serde_json::json!({ "error": msg }))).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// POST /aiResults: a remote worker's completion for a pending task.
async fn post_results(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let headers = req.headers().clone();

    if header_str(&headers, CREDENTIALS_HEADER) != state.config.orch_secret {
        return reject(StatusCode::UNAUTHORIZED, "invalid credentials");
    }
    if header_str(&headers, header::AUTHORIZATION.as_str()) != PROTOCOL_VERSION {
        return reject(StatusCode::BAD_REQUEST, "unsupported protocol version");
    }
    let task_id: u64 = match header_str(&headers, TASK_ID_HEADER).parse() {
        Ok(id) => id,
        Err(_) => return reject(StatusCode::BAD_REQUEST, "missing or invalid TaskId"),
    };

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).to_string();
    let completion = if content_type.starts_with("multipart/form-data") {
        let multipart = match Multipart::from_request(req, &state).await {
            Ok(m) => m,
            Err(e) => return reject(StatusCode::BAD_REQUEST, &e.body_text()),
        };
        match read_multipart(task_id, multipart).await {
            Ok(c) => c,
            Err(msg) => return reject(StatusCode::BAD_REQUEST, &msg),
        }
    } else {
        let body = match Bytes::from_request(req, &state).await {
            Ok(b) => b,
            Err(e) => return reject(StatusCode::BAD_REQUEST, &e.body_text()),
        };
        if content_type.starts_with(ERROR_CONTENT_TYPE) {
            Completion::failure(task_id, String::from_utf8_lossy(&body).into_owned())
        } else {
            match serde_json::from_slice(&body) {
                Ok(value) => Completion::success(task_id, value),
                Err(e) => return reject(StatusCode::BAD_REQUEST, &format!("invalid results: {}", e)),
            }
        }
    };

    debug!("Remote result received for task {}", task_id);
    if state.remote.complete(None, completion) {
        StatusCode::OK.into_response()
    } else {
        reject(StatusCode::NOT_FOUND, "unknown task")
    }
}

async fn read_multipart(task_id: u64, mut multipart: Multipart) -> Result<Completion, String> {
    let mut completion = Completion {
        task_id,
        ..Default::default()
    };
    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let data = field.bytes().await.map_err(|e| e.body_text())?;
        if name == RESULTS_PART {
            let value = serde_json::from_slice(&data).map_err(|e| format!("invalid results: {}", e))?;
            completion.result = Some(value);
        } else {
            completion.attachments.insert(file_name.unwrap_or(name), data);
        }
    }
    if completion.result.is_none() {
        warn!("Multipart result for task {} has no results part", task_id);
        return Err("missing results part".into());
    }
    Ok(completion)
}
