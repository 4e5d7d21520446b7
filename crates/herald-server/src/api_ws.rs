//! Push endpoint: registers each WebSocket as a broadcast observer.

use crate::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use herald_notify::{NotifyError, PushSink};
use std::sync::Arc;

/// Upgrades the connection and hands it to [`handle_socket`].
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Bounded so a slow client backs up into per-send timeouts instead of memory.
    let (sink, mut rx) = PushSink::channel(state.push_channel_capacity);

    let connection_id = match state.pipeline.on_connection_open(sink) {
        Ok(id) => id,
        Err(NotifyError::ResourceExhausted { capacity }) => {
            tracing::warn!(capacity, "push connection refused: registry full");
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: "connection limit reached".into(),
            };
            let _ = sender.send(Message::Close(Some(frame))).await;
            return;
        }
        Err(e) => {
            tracing::error!("push connection refused: {}", e);
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    tracing::info!(connection_id = %connection_id, "push connection opened");

    let send_timeout = state.push_send_timeout;
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let write = sender.send(Message::Text(msg.into()));
            match tokio::time::timeout(send_timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        timeout = ?send_timeout,
                        "socket write timed out, dropping connection"
                    );
                    break;
                }
            }
        }
    });

    let pipeline = state.pipeline.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    pipeline.on_client_message(connection_id, text.as_str().as_bytes());
                }
                Ok(Message::Binary(bytes)) => {
                    pipeline.on_client_message(connection_id, &bytes);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(connection_id = %connection_id, "websocket read error: {}", e);
                    break;
                }
            }
        }
    });

    // Whichever side finishes first tears the session down.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.pipeline.on_connection_close(connection_id);
    tracing::info!(connection_id = %connection_id, "push connection closed");
}
