//! Worker pool routes, including the remote worker WebSocket endpoint.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use aidispatch_core::capabilities::PerCapabilityConstraints;
use aidispatch_remote::{ServerMessage, WorkerMessage};
use aidispatch_runtime::transport::CREDENTIALS_HEADER;

use crate::state::AppState;

/// Outbound frames buffered per connection.
const OUTBOUND_BUFFER: usize = 32;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workers", get(list_workers))
        .route("/workers/connect", get(connect_worker))
        .route("/capabilities", get(get_capabilities))
}

/// GET /api/workers: local runners and connected remote workers.
async fn list_workers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let remote = state.remote.workers();
    Json(serde_json::json!({
        "localRunners": state.local.runners(),
        "remote": remote,
        "remoteCount": remote.len(),
    }))
}

/// GET /api/capabilities: configured ceilings and remaining capacity.
async fn get_capabilities(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "constraints": state.registry.snapshot(),
        "available": state.registry.available(),
    }))
}

/// GET /api/workers/connect: remote worker connection.
///
/// Requires the node secret in `Credentials`. The first frame must be a
/// `register` message.
async fn connect_worker(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let authorized = headers
        .get(CREDENTIALS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == state.config.orch_secret)
        .unwrap_or(false);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid credentials" })),
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn parse_frame(msg: Message) -> Option<WorkerMessage> {
    match msg {
        Message::Text(text) => match serde_json::from_str(text.as_str()) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Ignoring malformed worker frame: {}", e);
                None
            }
        },
        _ => None,
    }
}

async fn read_registration(
    stream: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<PerCapabilityConstraints> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(msg) => {
                return match parse_frame(msg) {
                    Some(WorkerMessage::Register { capabilities }) => Some(capabilities),
                    _ => None,
                }
            }
            Err(e) => {
                debug!("Worker connection failed before registering: {}", e);
                return None;
            }
        }
    }
    None
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    let Some(capabilities) = read_registration(&mut stream).await else {
        warn!("Remote worker did not register; closing");
        let _ = sink.close().await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode worker frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!("Worker socket sink closed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = stream
        .take_while(|frame| {
            futures::future::ready(matches!(frame, Ok(msg) if !matches!(msg, Message::Close(_))))
        })
        .filter_map(|frame| futures::future::ready(frame.ok().and_then(parse_frame)));

    let worker_id = state.remote.manage(capabilities, tx, inbound).await;
    let _ = send_task.await;
    info!("Remote worker {} disconnected", worker_id);
}
