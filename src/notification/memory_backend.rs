use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::StreamExt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;
use validator::Validate;

use super::{
    notification_backend::{ChangeFeed, NotificationBackend},
    notification_models::{ChangeEvent, ChangeKind, NewNotification, Notification},
};
use crate::error::{AppError, Result};

/// Process-local backend. Rows live in a `DashMap` and every mutation is
/// published on a broadcast channel that subscriptions filter by user.
#[derive(Clone)]
pub struct InMemoryBackend {
    rows: Arc<DashMap<Uuid, Notification>>,
    changes: broadcast::Sender<ChangeEvent>,
    subscribers: Arc<DashMap<Uuid, usize>>,
    fail_next: Arc<AtomicBool>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(100);
        Self {
            rows: Arc::new(DashMap::new()),
            changes,
            subscribers: Arc::new(DashMap::new()),
            fail_next: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stores a fully formed row as-is, publishing an insert event.
    pub fn seed(&self, notification: Notification) {
        let event = ChangeEvent {
            kind: ChangeKind::Insert,
            user_id: notification.user_id,
            notification_id: notification.id,
        };
        self.rows.insert(notification.id, notification);
        self.publish(event);
    }

    /// Removes a row, publishing a delete event.
    pub fn remove(&self, id: Uuid) -> Option<Notification> {
        let (_, removed) = self.rows.remove(&id)?;
        self.publish(ChangeEvent {
            kind: ChangeKind::Delete,
            user_id: removed.user_id,
            notification_id: removed.id,
        });
        Some(removed)
    }

    pub fn get(&self, id: Uuid) -> Option<Notification> {
        self.rows.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of live change feeds for `user_id`.
    pub fn active_subscriptions(&self, user_id: Uuid) -> usize {
        self.subscribers.get(&user_id).map(|count| *count).unwrap_or(0)
    }

    /// Makes the next backend call fail with `AppError::Backend`.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check_fault(&self) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AppError::Backend("injected failure".to_string()));
        }
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine; nobody is watching this user.
        let _ = self.changes.send(event);
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationBackend for InMemoryBackend {
    async fn fetch_recent(&self, user_id: Uuid, limit: usize) -> Result<Vec<Notification>> {
        self.check_fault()?;

        let mut notifications: Vec<Notification> = self
            .rows
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        notifications.truncate(limit);

        Ok(notifications)
    }

    async fn mark_read(&self, id: Uuid) -> Result<()> {
        self.check_fault()?;

        let changed = self.rows.get_mut(&id).map(|mut row| {
            row.read = true;
            row.user_id
        });
        if let Some(user_id) = changed {
            self.publish(ChangeEvent {
                kind: ChangeKind::Update,
                user_id,
                notification_id: id,
            });
        }

        Ok(())
    }

    async fn mark_all_read(&self, user_id: Uuid) -> Result<()> {
        self.check_fault()?;

        let mut updated = Vec::new();
        for mut row in self.rows.iter_mut() {
            if row.user_id == user_id && !row.read {
                row.read = true;
                updated.push(row.id);
            }
        }
        for id in updated {
            self.publish(ChangeEvent {
                kind: ChangeKind::Update,
                user_id,
                notification_id: id,
            });
        }

        Ok(())
    }

    async fn insert(&self, new: NewNotification) -> Result<Notification> {
        self.check_fault()?;
        new.validate()?;

        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            kind: new.kind,
            title: new.title,
            message: new.message,
            action_url: new.action_url,
            metadata: new.metadata,
            read: false,
            created_at: Utc::now(),
        };
        self.seed(notification.clone());

        Ok(notification)
    }

    async fn subscribe(&self, user_id: Uuid) -> Result<ChangeFeed> {
        self.check_fault()?;

        let token = SubscriberToken::register(self.subscribers.clone(), user_id);
        let feed = BroadcastStream::new(self.changes.subscribe()).filter_map(move |event| {
            // The token lives as long as the stream does.
            let _held = &token;
            let event = match event {
                Ok(event) if event.user_id == user_id => Some(event),
                Ok(_) => None,
                Err(e) => {
                    // Dropped events may include ours.
                    tracing::warn!("Change feed for user {} lagged, resyncing: {}", user_id, e);
                    Some(ChangeEvent::resync(user_id))
                }
            };
            async move { event }
        });

        Ok(feed.boxed())
    }
}

struct SubscriberToken {
    subscribers: Arc<DashMap<Uuid, usize>>,
    user_id: Uuid,
}

impl SubscriberToken {
    fn register(subscribers: Arc<DashMap<Uuid, usize>>, user_id: Uuid) -> Self {
        *subscribers.entry(user_id).or_insert(0) += 1;
        Self {
            subscribers,
            user_id,
        }
    }
}

impl Drop for SubscriberToken {
    fn drop(&mut self) {
        self.subscribers.remove_if_mut(&self.user_id, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}
