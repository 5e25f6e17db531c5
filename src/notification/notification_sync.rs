use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    notification_backend::{ChangeFeed, NotificationBackend},
    notification_models::{NewNotification, Notification, NotificationState, DEFAULT_FETCH_LIMIT},
};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, Default)]
struct Binding {
    generation: u64,
    user_id: Option<Uuid>,
}

/// Binding generation whose change feed is not live, with the reason.
#[derive(Debug, Clone)]
struct FeedFault {
    generation: u64,
    message: String,
}

struct SyncInner {
    backend: Arc<dyn NotificationBackend>,
    fetch_limit: usize,
    binding: watch::Sender<Binding>,
    state: watch::Sender<NotificationState>,
    feed_fault: watch::Sender<Option<FeedFault>>,
}

/// Keeps one user's notifications mirrored from a [`NotificationBackend`].
///
/// Binding a user acquires a single change subscription; every change event
/// triggers a full refresh. Rebinding or dropping the sync releases the
/// subscription. Results of requests issued under an earlier binding are
/// discarded.
pub struct NotificationSync {
    inner: Arc<SyncInner>,
    subscription: Mutex<Option<SubscriptionGuard>>,
}

impl NotificationSync {
    pub fn new(backend: Arc<dyn NotificationBackend>) -> Self {
        Self::with_fetch_limit(backend, DEFAULT_FETCH_LIMIT)
    }

    pub fn with_fetch_limit(backend: Arc<dyn NotificationBackend>, fetch_limit: usize) -> Self {
        let (binding, _) = watch::channel(Binding::default());
        let (state, _) = watch::channel(NotificationState::default());
        let (feed_fault, _) = watch::channel(None);
        Self {
            inner: Arc::new(SyncInner {
                backend,
                fetch_limit,
                binding,
                state,
                feed_fault,
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Binds `user_id` (or unbinds with `None`). The previous subscription is
    /// released before a new one is acquired. Binding the already bound user
    /// is a no-op unless its change feed failed or ended, in which case the
    /// user is bound afresh.
    pub async fn bind(&self, user_id: Option<Uuid>) -> Result<()> {
        let mut subscription = self.subscription.lock().await;

        let current = *self.inner.binding.borrow();
        if current.user_id == user_id && self.inner.feed_fault_for(current.generation).is_none() {
            return Ok(());
        }

        if let Some(previous) = subscription.take() {
            previous.release().await;
        }

        let mut generation = 0;
        self.inner.binding.send_modify(|binding| {
            binding.generation += 1;
            binding.user_id = user_id;
            generation = binding.generation;
        });
        self.inner.state.send_modify(|state| {
            state.clear();
            state.user_id = user_id;
        });

        let Some(user_id) = user_id else {
            debug!("Notification sync unbound");
            return Ok(());
        };

        let subscribed = match self.inner.backend.subscribe(user_id).await {
            Ok(feed) => {
                *subscription = Some(SubscriptionGuard::spawn(
                    self.inner.clone(),
                    generation,
                    user_id,
                    feed,
                ));
                Ok(())
            }
            Err(e) => {
                warn!("Failed to subscribe to notification changes for {}: {}", user_id, e);
                self.inner.record_feed_fault(generation, e.to_string());
                Err(e)
            }
        };
        drop(subscription);

        self.inner.refresh().await?;
        subscribed
    }

    /// Convenience for `bind(None)`.
    pub async fn unbind(&self) -> Result<()> {
        self.bind(None).await
    }

    /// Re-fetches the bound user's most recent notifications. Failures are
    /// recorded in the state and also returned.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }

    /// Marks one notification read. Local state changes only after the
    /// backend confirms the update.
    pub async fn mark_as_read(&self, notification_id: Uuid) -> Result<()> {
        let generation = self.inner.binding.borrow().generation;

        self.inner.backend.mark_read(notification_id).await.map_err(|e| {
            warn!("Failed to mark notification {} read: {}", notification_id, e);
            e
        })?;

        self.inner.apply_if_current(generation, |state| {
            let Some(notification) = state
                .notifications
                .iter_mut()
                .find(|n| n.id == notification_id && !n.read)
            else {
                return false;
            };
            notification.read = true;
            state.unread_count = state.unread_count.saturating_sub(1);
            true
        });

        Ok(())
    }

    /// Marks every notification of the bound user read. No-op when unbound.
    pub async fn mark_all_as_read(&self) -> Result<()> {
        let Binding { generation, user_id } = *self.inner.binding.borrow();
        let Some(user_id) = user_id else {
            return Ok(());
        };

        self.inner.backend.mark_all_read(user_id).await.map_err(|e| {
            warn!("Failed to mark all notifications read for {}: {}", user_id, e);
            e
        })?;

        self.inner.apply_if_current(generation, |state| {
            state.notifications.iter_mut().for_each(|n| n.read = true);
            let modified = state.unread_count != 0;
            state.unread_count = 0;
            modified
        });

        Ok(())
    }

    /// Inserts a notification for any user. Local state is left to the change
    /// feed.
    pub async fn create_notification(&self, new: NewNotification) -> Result<Notification> {
        self.inner.backend.insert(new).await.map_err(|e| {
            warn!("Failed to create notification: {}", e);
            e
        })
    }

    pub fn state(&self) -> NotificationState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NotificationState> {
        self.inner.state.subscribe()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.inner.binding.borrow().user_id
    }
}

impl SyncInner {
    async fn refresh(&self) -> Result<()> {
        let Binding { generation, user_id } = *self.binding.borrow();

        let Some(user_id) = user_id else {
            self.apply_if_current(generation, |state| {
                state.clear();
                true
            });
            return Ok(());
        };

        self.apply_if_current(generation, |state| {
            state.loading = true;
            true
        });

        debug!("Refreshing notifications for {}", user_id);
        let result = self.backend.fetch_recent(user_id, self.fetch_limit).await;

        match result {
            Ok(mut notifications) => {
                notifications.truncate(self.fetch_limit);
                let applied = self.apply_if_current(generation, move |state| {
                    state.unread_count = NotificationState::count_unread(&notifications);
                    state.notifications = notifications;
                    // A loaded list without a live feed still reports the feed.
                    state.error = self.feed_fault_for(generation);
                    state.loading = false;
                    true
                });
                if !applied {
                    debug!("Discarding stale refresh for {}", user_id);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to fetch notifications for {}: {}", user_id, e);
                let message = e.to_string();
                self.apply_if_current(generation, move |state| {
                    state.error = Some(message);
                    state.loading = false;
                    true
                });
                Err(e)
            }
        }
    }

    fn feed_fault_for(&self, generation: u64) -> Option<String> {
        self.feed_fault
            .borrow()
            .as_ref()
            .filter(|fault| fault.generation == generation)
            .map(|fault| fault.message.clone())
    }

    /// Marks the feed of `generation` as gone and surfaces `message` if that
    /// binding is still current.
    fn record_feed_fault(&self, generation: u64, message: String) {
        self.feed_fault.send_replace(Some(FeedFault {
            generation,
            message: message.clone(),
        }));
        self.apply_if_current(generation, move |state| {
            state.error = Some(message);
            true
        });
    }

    /// Runs `patch` against the state only while the binding that issued the
    /// request is still current. Returns whether the state changed.
    fn apply_if_current<F>(&self, generation: u64, patch: F) -> bool
    where
        F: FnOnce(&mut NotificationState) -> bool,
    {
        self.state.send_if_modified(|state| {
            if self.binding.borrow().generation != generation {
                return false;
            }
            patch(state)
        })
    }
}

/// Owns the task draining a change feed. Dropping it aborts the task, which
/// drops the feed and with it the backend subscription.
struct SubscriptionGuard {
    user_id: Uuid,
    task: JoinHandle<()>,
}

impl SubscriptionGuard {
    fn spawn(inner: Arc<SyncInner>, generation: u64, user_id: Uuid, mut feed: ChangeFeed) -> Self {
        debug!("Subscribed to notification changes for {}", user_id);
        let task = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                debug!("Change {:?} on notification {}", event.kind, event.notification_id);
                if let Err(e) = inner.refresh().await {
                    warn!("Refresh after change event failed: {}", e);
                }
            }
            warn!("Change feed for {} ended", user_id);
            let err = AppError::Subscription("change feed ended".to_string());
            inner.record_feed_fault(generation, err.to_string());
        });
        Self { user_id, task }
    }

    /// Aborts the feed task and waits until it has been torn down.
    async fn release(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        debug!("Released notification subscription for {}", self.user_id);
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}
