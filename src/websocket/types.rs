use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notification::notification_models::{NewNotification, Notification, NotificationState};

// Server-to-client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Snapshot(NotificationState),
    Created { notification: Notification },
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

// Client-to-server messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Refresh,
    MarkAsRead {
        notification_id: Uuid,
    },
    MarkAllAsRead,
    CreateNotification {
        notification: NewNotification,
    },
}
