//! WebSocket handler.
//!
//! Pumps frames between the socket and a [`Session`].

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use lagless_engine::UserId;
use tokio::sync::mpsc;

use crate::websocket::{encode, ServerMessage};
use crate::AppState;

use super::Session;

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Opens a session for the connection
/// 2. Spawns a task to forward outgoing messages
/// 3. Feeds incoming frames to the session in order
/// 4. Drops the session on disconnect, which stops its subscriptions
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, user_id: Option<UserId>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Sessions, subscriptions and observers all write into this channel
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut session = Session::new(state.clone(), user_id.clone(), tx);
    let session_id = session.id().to_string();

    tracing::info!(
        session_id = %session_id,
        user_id = ?user_id,
        "WebSocket client connected"
    );

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match encode(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                session.handle_text(text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!(session_id = %session_id, "Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(session_id = %session_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    let subscriptions = session.live_subscriptions();
    drop(session);
    send_task.abort();

    tracing::info!(
        session_id = %session_id,
        subscriptions,
        active_connections = state.conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}
