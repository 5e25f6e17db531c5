use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Upper bound on how many notifications a sync session keeps locally.
pub const DEFAULT_FETCH_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields a caller supplies when creating a notification. The backend assigns
/// `id`, `read` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    pub user_id: Uuid,
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "type is required"))]
    pub kind: String,
    #[validate(length(min = 1, message = "title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "message is required"))]
    pub message: String,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
}

impl NewNotification {
    pub fn new(
        user_id: Uuid,
        kind: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            kind: kind.into(),
            title: title.into(),
            message: message.into(),
            action_url: None,
            metadata: None,
        }
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Events may have been missed; the whole list has to be re-fetched.
    Resync,
}

/// Signal that a notification row owned by `user_id` changed. Consumers treat
/// it as "something changed" and re-fetch. `Resync` events carry a nil id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "op")]
    pub kind: ChangeKind,
    pub user_id: Uuid,
    #[serde(rename = "id")]
    pub notification_id: Uuid,
}

impl ChangeEvent {
    pub fn resync(user_id: Uuid) -> Self {
        Self {
            kind: ChangeKind::Resync,
            user_id,
            notification_id: Uuid::nil(),
        }
    }
}

/// Client-side view of one user's notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationState {
    pub user_id: Option<Uuid>,
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
    pub loading: bool,
    pub error: Option<String>,
}

impl NotificationState {
    pub fn count_unread(notifications: &[Notification]) -> usize {
        notifications.iter().filter(|n| !n.read).count()
    }

    pub(crate) fn clear(&mut self) {
        self.notifications.clear();
        self.unread_count = 0;
        self.loading = false;
        self.error = None;
    }
}
