//! WebSocket handler for kiosk voice clients

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::ApiState;
use crate::voice::{ClientMessage, ServerMessage};

/// Outbound messages buffered per client
const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Optional query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
struct WsQuery {
    client_id: Option<String>,
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/voice", get(ws_handler))
        .with_state(state)
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let client_id = query
        .client_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("kiosk-{}", uuid::Uuid::new_v4()));
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>, client_id: String) {
    let (mut sender, mut receiver) = socket.split();

    // The registry owns the only sender; dropping the session ends the writer
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(CLIENT_QUEUE_CAPACITY);
    let connection_id = state.orchestrator.handle_connect(&client_id, tx);

    tracing::info!(client_id = %client_id, "WebSocket connected");

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, kind = msg.kind(), "failed to serialize message"),
            }
        }
        let _ = sender.close().await;
    });

    // Handle incoming messages
    let recv_state = Arc::clone(&state);
    let recv_client = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        let orchestrator = &recv_state.orchestrator;
        while let Some(msg) = receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(client_id = %recv_client, error = %e, "WebSocket read failed");
                    break;
                }
            };

            match msg {
                Message::Text(text) => match ClientMessage::parse(text.as_str()) {
                    Ok(message) => orchestrator.handle_message(&recv_client, message).await,
                    Err(e) => orchestrator.handle_protocol_error(&recv_client, &e).await,
                },
                Message::Binary(audio) => orchestrator.handle_audio(&recv_client, audio),
                Message::Ping(data) => {
                    // axum handles pong automatically
                    tracing::trace!(len = data.len(), "received ping");
                }
                Message::Close(_) => {
                    tracing::info!(client_id = %recv_client, "WebSocket closed by client");
                    break;
                }
                Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.orchestrator.handle_disconnect(&client_id, connection_id);
    tracing::info!(client_id = %client_id, "WebSocket disconnected");
}
