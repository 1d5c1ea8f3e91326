//! WebSocket hub that agents connect to for assignment notifications.
//!
//! A session names its worker with `?worker_id=<uuid>` and joins that
//! worker's group for the lifetime of the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use assignrelay_core::{group_key_for, WorkerId};
use tracing::{debug, error, info, warn};

use crate::metrics::{
    HUB_FRAMES_SENT, HUB_SESSIONS_ACTIVE, HUB_SESSIONS_REFUSED, HUB_SESSIONS_TOTAL,
};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HubQuery {
    pub worker_id: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn hub_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HubQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(raw) = query.worker_id else {
        HUB_SESSIONS_REFUSED.with_label_values(&["missing_worker_id"]).inc();
        return (StatusCode::BAD_REQUEST, "worker_id query parameter is required").into_response();
    };
    let worker_id: WorkerId = match raw.parse() {
        Ok(id) => id,
        Err(e) => {
            debug!(worker_id = %raw, error = %e, "Refusing hub session with invalid worker id");
            HUB_SESSIONS_REFUSED.with_label_values(&["invalid_worker_id"]).inc();
            return (StatusCode::BAD_REQUEST, "worker_id must be a UUID").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, worker_id))
}

/// Handle a single hub session.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, worker_id: WorkerId) {
    let (mut sender, mut receiver) = socket.split();

    let group = group_key_for(worker_id);
    let subscription = state.sessions().join(&group).await;
    let session_id = subscription.id;
    let mut frames = subscription.receiver;

    HUB_SESSIONS_TOTAL.inc();
    HUB_SESSIONS_ACTIVE.inc();

    info!(%worker_id, session_id, "Hub session connected");

    // Forward group frames to this client
    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("Hub send failed, client disconnected");
                        break;
                    }
                    HUB_FRAMES_SENT
                        .with_label_values(&[frame.event.as_str()])
                        .inc();
                }
                Err(e) => {
                    error!("Failed to serialize hub frame: {}", e);
                }
            }
        }
    });

    // Drain client frames until close
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                debug!("Hub client requested close");
                break;
            }
            Ok(Message::Text(text)) => {
                debug!("Ignoring text frame from hub client: {}", text);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Hub receive error: {}", e);
                break;
            }
        }
    }

    state.sessions().leave(&group, session_id).await;
    send_task.abort();
    HUB_SESSIONS_ACTIVE.dec();
    info!(%worker_id, session_id, "Hub session disconnected");
}
