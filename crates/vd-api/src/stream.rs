//! `/stream` WebSocket: the client names a session, then receives `{ delta }`
//! frames until the end marker.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use vd_runtime::{StreamFrame, StreamHub};

use crate::model::StreamConnect;
use crate::AppState;

pub async fn stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.streams.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Session id from a connect frame, if it is one
pub fn parse_connect(text: &str) -> Option<String> {
    match serde_json::from_str::<StreamConnect>(text) {
        Ok(req) if req.connect && !req.session_id.is_empty() => Some(req.session_id),
        _ => None,
    }
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<StreamHub>) {
    let session_id = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match parse_connect(&text) {
                Some(id) => break id,
                None => {
                    let error = json!({ "error": "expected {\"sessionId\": ..., \"connect\": true}" });
                    let _ = socket.send(Message::Text(error.to_string())).await;
                    return;
                }
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        }
    };

    debug!(session_id = %session_id, "Stream client connected");
    let mut frames = hub.subscribe(&session_id);

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    let end = frame.is_end();
                    if send_frame(&mut socket, &frame).await.is_err() || end {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %session_id, skipped, "Stream client lagging, frames dropped");
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(frames);
    hub.release(&session_id);
    let _ = socket.send(Message::Close(None)).await;
    debug!(session_id = %session_id, "Stream client disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}
