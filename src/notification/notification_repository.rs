use async_trait::async_trait;
use futures::stream::StreamExt;
use sqlx::{postgres::PgListener, PgPool};
use uuid::Uuid;
use validator::Validate;

use super::{
    notification_backend::{ChangeFeed, NotificationBackend},
    notification_models::{ChangeEvent, NewNotification, Notification},
};
use crate::error::{AppError, Result};

/// Channel the `notifications_notify_change` trigger publishes on.
pub const CHANGE_CHANNEL: &str = "notification_changes";

#[derive(Clone)]
pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationBackend for PgNotificationRepository {
    async fn fetch_recent(&self, user_id: Uuid, limit: usize) -> Result<Vec<Notification>> {
        let limit = i64::try_from(limit)
            .map_err(|_| AppError::BadRequest(format!("limit {} out of range", limit)))?;

        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }

    async fn mark_read(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE notifications SET read = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_all_read(&self, user_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notifications SET read = true WHERE user_id = $1 AND read = false"
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Marked {} notifications read for user {}", result.rows_affected(), user_id);
        Ok(())
    }

    async fn insert(&self, new: NewNotification) -> Result<Notification> {
        new.validate()?;

        let notification = sqlx::query_as::<_, Notification>(
            "INSERT INTO notifications (user_id, type, title, message, action_url, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *"
        )
        .bind(new.user_id)
        .bind(&new.kind)
        .bind(&new.title)
        .bind(&new.message)
        .bind(&new.action_url)
        .bind(&new.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn subscribe(&self, user_id: Uuid) -> Result<ChangeFeed> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| AppError::Subscription(e.to_string()))?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| AppError::Subscription(e.to_string()))?;

        tracing::debug!("Listening on {} for user {}", CHANGE_CHANNEL, user_id);

        let feed = listener.into_stream().filter_map(move |message| {
            let event = match message {
                Ok(notification) => match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                    Ok(event) if event.user_id == user_id => Some(event),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!("Skipping malformed change payload: {}", e);
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!("Change listener error for user {}: {:?}", user_id, e);
                    None
                }
            };
            async move { event }
        });

        Ok(feed.boxed())
    }
}
