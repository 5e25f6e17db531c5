use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use super::notification_models::{ChangeEvent, NewNotification, Notification};
use crate::error::Result;

/// Stream of change events for a single user. Dropping it releases the
/// underlying subscription.
pub type ChangeFeed = BoxStream<'static, ChangeEvent>;

/// Query, mutation and change-subscription primitives over the notifications
/// table of the hosted backend.
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// Most recent notifications for `user_id`, newest first, at most `limit`.
    async fn fetch_recent(&self, user_id: Uuid, limit: usize) -> Result<Vec<Notification>>;

    /// Sets `read = true` on the row with `id`. Matching no row is not an error.
    async fn mark_read(&self, id: Uuid) -> Result<()>;

    /// Sets `read = true` on every unread row owned by `user_id`.
    async fn mark_all_read(&self, user_id: Uuid) -> Result<()>;

    async fn insert(&self, new: NewNotification) -> Result<Notification>;

    /// Registers for insert/update/delete events on rows owned by `user_id`.
    async fn subscribe(&self, user_id: Uuid) -> Result<ChangeFeed>;
}
