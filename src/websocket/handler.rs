use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    notification::NotificationSync,
    state::AppState,
    websocket::types::{ClientMessage, ErrorPayload, WsMessage},
};

/// WebSocket upgrade handler; the session is bound to `user_id`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: Uuid, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let session_id = state.sessions.open(user_id);
    let sync = Arc::new(NotificationSync::with_fetch_limit(
        state.backend.clone(),
        state.config.fetch_limit,
    ));

    // Push every state change as a snapshot
    let mut state_rx = sync.subscribe_state();
    let snapshot_tx = tx.clone();
    let mut snapshot_task = tokio::spawn(async move {
        loop {
            let snapshot = state_rx.borrow_and_update().clone();
            if snapshot_tx.send(WsMessage::Snapshot(snapshot)).is_err() {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    });

    // Spawn task to send messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    if let Err(e) = sync.bind(Some(user_id)).await {
        tracing::warn!("Initial sync for user {} failed: {}", user_id, e);
    }

    // Spawn task to receive messages from WebSocket
    let sync_clone = sync.clone();
    let tx_clone = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Err(e) = process_client_message(&text, &sync_clone, &tx_clone).await {
                    tracing::error!("Error processing message: {:?}", e);
                    let error_msg = WsMessage::Error(ErrorPayload {
                        message: e.to_string(),
                    });
                    let _ = tx_clone.send(error_msg);
                }
            } else if let Message::Close(_) = msg {
                break;
            }
        }
    });

    // Wait for any task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        _ = &mut snapshot_task => {
            recv_task.abort();
            send_task.abort();
        }
    }
    snapshot_task.abort();

    if let Err(e) = sync.unbind().await {
        tracing::warn!("Failed to release sync for user {}: {}", user_id, e);
    }
    state.sessions.close(&session_id);
}

async fn process_client_message(
    text: &str,
    sync: &NotificationSync,
    tx: &mpsc::UnboundedSender<WsMessage>,
) -> Result<()> {
    let client_msg: ClientMessage = serde_json::from_str(text)
        .map_err(|e| AppError::BadRequest(format!("Invalid message format: {}", e)))?;

    match client_msg {
        ClientMessage::Refresh => sync.refresh().await?,
        ClientMessage::MarkAsRead { notification_id } => sync.mark_as_read(notification_id).await?,
        ClientMessage::MarkAllAsRead => sync.mark_all_as_read().await?,
        ClientMessage::CreateNotification { notification } => {
            let notification = sync.create_notification(notification).await?;
            let _ = tx.send(WsMessage::Created { notification });
        }
    }

    Ok(())
}
