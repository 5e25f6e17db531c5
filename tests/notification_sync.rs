//! Behaviour of `NotificationSync` against the in-memory backend: refresh
//! bookkeeping, read-state mutations, subscription lifecycle and the guard
//! against results that arrive after the binding changed.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use hackathon_notifications::error::{AppError, Result};
use hackathon_notifications::notification::{
    ChangeEvent, ChangeFeed, InMemoryBackend, NewNotification, Notification, NotificationBackend,
    NotificationState, NotificationSync,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Wraps the in-memory backend, counting fetches and optionally holding one
/// fetch until the test releases it.
struct CountingBackend {
    inner: InMemoryBackend,
    fetches: AtomicUsize,
    hold: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
}

impl CountingBackend {
    fn new(inner: InMemoryBackend) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fetches: AtomicUsize::new(0),
            hold: Mutex::new(None),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Holds the next fetch. Returns (entered, release).
    fn hold_next_fetch(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.hold.lock().unwrap() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }
}

#[async_trait]
impl NotificationBackend for CountingBackend {
    async fn fetch_recent(&self, user_id: Uuid, limit: usize) -> Result<Vec<Notification>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold.lock().unwrap().take();
        let result = self.inner.fetch_recent(user_id, limit).await;
        if let Some((entered, release)) = hold {
            let _ = entered.send(());
            let _ = release.await;
        }
        result
    }

    async fn mark_read(&self, id: Uuid) -> Result<()> {
        self.inner.mark_read(id).await
    }

    async fn mark_all_read(&self, user_id: Uuid) -> Result<()> {
        self.inner.mark_all_read(user_id).await
    }

    async fn insert(&self, new: NewNotification) -> Result<Notification> {
        self.inner.insert(new).await
    }

    async fn subscribe(&self, user_id: Uuid) -> Result<ChangeFeed> {
        self.inner.subscribe(user_id).await
    }
}

/// Hands out feeds that end immediately for the first `ending_feeds`
/// subscriptions, then delegates to the in-memory backend.
struct EndingFeedBackend {
    inner: InMemoryBackend,
    ending_feeds: AtomicUsize,
}

#[async_trait]
impl NotificationBackend for EndingFeedBackend {
    async fn fetch_recent(&self, user_id: Uuid, limit: usize) -> Result<Vec<Notification>> {
        self.inner.fetch_recent(user_id, limit).await
    }

    async fn mark_read(&self, id: Uuid) -> Result<()> {
        self.inner.mark_read(id).await
    }

    async fn mark_all_read(&self, user_id: Uuid) -> Result<()> {
        self.inner.mark_all_read(user_id).await
    }

    async fn insert(&self, new: NewNotification) -> Result<Notification> {
        self.inner.insert(new).await
    }

    async fn subscribe(&self, user_id: Uuid) -> Result<ChangeFeed> {
        let ending = self
            .ending_feeds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if ending {
            return Ok(stream::empty::<ChangeEvent>().boxed());
        }
        self.inner.subscribe(user_id).await
    }
}

fn notification(user_id: Uuid, title: &str, read: bool, minutes_ago: i64) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        user_id,
        kind: "team_invite".to_string(),
        title: title.to_string(),
        message: format!("{} message", title),
        action_url: None,
        metadata: None,
        read,
        created_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
    }
}

/// Seeds 3 unread and 2 read notifications for `user_id`.
fn seed_mixed(backend: &InMemoryBackend, user_id: Uuid) -> Vec<Notification> {
    let rows = vec![
        notification(user_id, "unread-1", false, 1),
        notification(user_id, "read-1", true, 2),
        notification(user_id, "unread-2", false, 3),
        notification(user_id, "read-2", true, 4),
        notification(user_id, "unread-3", false, 5),
    ];
    for row in &rows {
        backend.seed(row.clone());
    }
    rows
}

async fn wait_for_state<F>(sync: &NotificationSync, predicate: F) -> NotificationState
where
    F: Fn(&NotificationState) -> bool,
{
    let mut rx = sync.subscribe_state();
    let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed")
        .clone();
    state
}

fn assert_unread_consistent(state: &NotificationState) {
    assert_eq!(
        state.unread_count,
        state.notifications.iter().filter(|n| !n.read).count()
    );
}

#[tokio::test]
async fn refresh_loads_list_and_counts_unread() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    seed_mixed(&backend, user_id);

    let sync = NotificationSync::new(Arc::new(backend));
    sync.bind(Some(user_id)).await.unwrap();

    let state = sync.state();
    assert_eq!(state.user_id, Some(user_id));
    assert_eq!(state.notifications.len(), 5);
    assert_eq!(state.unread_count, 3);
    assert!(!state.loading);
    assert!(state.error.is_none());
    assert_unread_consistent(&state);
}

#[tokio::test]
async fn refresh_caps_list_at_fifty_newest_first() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    for i in 0..60 {
        backend.seed(notification(user_id, &format!("n{}", i), i % 2 == 0, i));
    }

    let sync = NotificationSync::new(Arc::new(backend));
    sync.bind(Some(user_id)).await.unwrap();

    let state = sync.state();
    assert_eq!(state.notifications.len(), 50);
    assert!(state
        .notifications
        .windows(2)
        .all(|w| w[0].created_at >= w[1].created_at));
    assert_eq!(state.notifications[0].title, "n0");
    assert_unread_consistent(&state);
}

#[tokio::test]
async fn unbinding_clears_state() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    seed_mixed(&backend, user_id);

    let sync = NotificationSync::new(Arc::new(backend.clone()));
    sync.bind(Some(user_id)).await.unwrap();
    sync.unbind().await.unwrap();

    let state = sync.state();
    assert!(state.user_id.is_none());
    assert!(state.notifications.is_empty());
    assert_eq!(state.unread_count, 0);
    assert!(!state.loading);
    assert_eq!(backend.active_subscriptions(user_id), 0);
}

#[tokio::test]
async fn refresh_failure_keeps_list_and_records_error() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    seed_mixed(&backend, user_id);

    let sync = NotificationSync::new(Arc::new(backend.clone()));
    sync.bind(Some(user_id)).await.unwrap();

    backend.fail_next();
    let err = sync.refresh().await.unwrap_err();
    assert!(matches!(err, AppError::Backend(_)));

    let state = sync.state();
    assert_eq!(state.notifications.len(), 5);
    assert_eq!(state.unread_count, 3);
    assert!(!state.loading);
    assert!(state.error.as_deref().unwrap().contains("injected failure"));

    sync.refresh().await.unwrap();
    assert!(sync.state().error.is_none());
}

#[tokio::test]
async fn mark_as_read_flips_only_that_entry() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    let rows = seed_mixed(&backend, user_id);
    let target = rows[2].id;

    let sync = NotificationSync::new(Arc::new(backend.clone()));
    sync.bind(Some(user_id)).await.unwrap();
    let before = sync.state();

    sync.mark_as_read(target).await.unwrap();

    let after = sync.state();
    assert_eq!(after.unread_count, before.unread_count - 1);
    for (old, new) in before.notifications.iter().zip(&after.notifications) {
        if new.id == target {
            assert!(new.read);
        } else {
            assert_eq!(old.read, new.read);
        }
    }
    assert!(backend.get(target).unwrap().read);
    assert_unread_consistent(&after);
}

#[tokio::test]
async fn mark_as_read_on_unknown_or_read_entry_keeps_count() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    let rows = seed_mixed(&backend, user_id);

    let sync = NotificationSync::new(Arc::new(backend));
    sync.bind(Some(user_id)).await.unwrap();

    sync.mark_as_read(Uuid::new_v4()).await.unwrap();
    assert_eq!(sync.state().unread_count, 3);

    let already_read = rows[1].id;
    sync.mark_as_read(already_read).await.unwrap();
    assert_eq!(sync.state().unread_count, 3);
}

#[tokio::test]
async fn mark_as_read_failure_leaves_state_untouched() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    let rows = seed_mixed(&backend, user_id);

    let sync = NotificationSync::new(Arc::new(backend.clone()));
    sync.bind(Some(user_id)).await.unwrap();
    let before = sync.state();

    backend.fail_next();
    assert!(sync.mark_as_read(rows[0].id).await.is_err());
    assert_eq!(sync.state(), before);
}

#[tokio::test]
async fn mark_all_as_read_is_idempotent() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    seed_mixed(&backend, user_id);

    let sync = NotificationSync::new(Arc::new(backend));
    sync.bind(Some(user_id)).await.unwrap();

    sync.mark_all_as_read().await.unwrap();
    assert_eq!(sync.state().unread_count, 0);
    assert!(sync.state().notifications.iter().all(|n| n.read));

    sync.mark_all_as_read().await.unwrap();
    assert_eq!(sync.state().unread_count, 0);
    assert!(sync.state().error.is_none());
}

#[tokio::test]
async fn mark_all_as_read_without_user_is_noop() {
    let sync = NotificationSync::new(Arc::new(InMemoryBackend::new()));
    sync.mark_all_as_read().await.unwrap();
    assert_eq!(sync.state(), NotificationState::default());
}

#[tokio::test]
async fn mark_all_as_read_failure_leaves_state_untouched() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    seed_mixed(&backend, user_id);

    let sync = NotificationSync::new(Arc::new(backend.clone()));
    sync.bind(Some(user_id)).await.unwrap();

    backend.fail_next();
    assert!(sync.mark_all_as_read().await.is_err());
    assert_eq!(sync.state().unread_count, 3);
}

#[tokio::test]
async fn create_with_missing_title_returns_error_without_state_change() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    seed_mixed(&backend, user_id);

    let sync = NotificationSync::new(Arc::new(backend));
    sync.bind(Some(user_id)).await.unwrap();
    let before = sync.state();

    let err = sync
        .create_notification(NewNotification::new(user_id, "vote_cast", "", "Someone voted"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(sync.state(), before);
}

#[tokio::test]
async fn created_notification_arrives_through_change_feed() {
    let backend = CountingBackend::new(InMemoryBackend::new());
    let user_id = Uuid::new_v4();

    let sync = NotificationSync::new(backend.clone());
    sync.bind(Some(user_id)).await.unwrap();
    assert_eq!(backend.fetches(), 1);

    let created = sync
        .create_notification(
            NewNotification::new(user_id, "project_scored", "Scores are in", "Your project got 42")
                .with_action_url("/projects/7"),
        )
        .await
        .unwrap();
    assert_eq!(created.action_url.as_deref(), Some("/projects/7"));
    assert!(!created.read);

    let state = wait_for_state(&sync, |s| s.notifications.iter().any(|n| n.id == created.id)).await;
    assert_eq!(state.unread_count, 1);

    // Give any extra refresh a chance to run before counting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.fetches(), 2);
}

#[tokio::test]
async fn other_users_changes_do_not_refresh() {
    let backend = CountingBackend::new(InMemoryBackend::new());
    let user_id = Uuid::new_v4();

    let sync = NotificationSync::new(backend.clone());
    sync.bind(Some(user_id)).await.unwrap();

    backend
        .insert(NewNotification::new(Uuid::new_v4(), "team_invite", "Hi", "Not yours"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.fetches(), 1);
}

#[tokio::test]
async fn rebinding_keeps_one_subscription_per_user() {
    let backend = InMemoryBackend::new();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    seed_mixed(&backend, second);

    let sync = NotificationSync::new(Arc::new(backend.clone()));
    sync.bind(Some(first)).await.unwrap();
    assert_eq!(backend.active_subscriptions(first), 1);

    sync.bind(Some(first)).await.unwrap();
    assert_eq!(backend.active_subscriptions(first), 1);

    sync.bind(Some(second)).await.unwrap();
    assert_eq!(backend.active_subscriptions(first), 0);
    assert_eq!(backend.active_subscriptions(second), 1);
    assert_eq!(sync.state().notifications.len(), 5);

    sync.unbind().await.unwrap();
    assert_eq!(backend.active_subscriptions(second), 0);
}

#[tokio::test]
async fn dropping_sync_releases_subscription() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();

    let sync = NotificationSync::new(Arc::new(backend.clone()));
    sync.bind(Some(user_id)).await.unwrap();
    assert_eq!(backend.active_subscriptions(user_id), 1);

    drop(sync);
    tokio::time::timeout(Duration::from_secs(2), async {
        while backend.active_subscriptions(user_id) != 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("subscription was not released");
}

#[tokio::test]
async fn subscribe_failure_is_reported_but_list_still_loads() {
    let inner = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    seed_mixed(&inner, user_id);

    let sync = NotificationSync::new(Arc::new(inner.clone()));
    inner.fail_next();
    assert!(sync.bind(Some(user_id)).await.is_err());

    let state = sync.state();
    assert_eq!(state.notifications.len(), 5);
    assert!(state.error.is_some());
    assert_eq!(inner.active_subscriptions(user_id), 0);

    // A successful refresh keeps reporting the missing feed.
    sync.refresh().await.unwrap();
    assert!(sync.state().error.is_some());

    sync.bind(Some(user_id)).await.unwrap();
    assert_eq!(inner.active_subscriptions(user_id), 1);
    assert!(sync.state().error.is_none());
}

#[tokio::test]
async fn ended_feed_is_reported_and_rebinding_recovers() {
    let inner = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    seed_mixed(&inner, user_id);
    let backend = Arc::new(EndingFeedBackend {
        inner: inner.clone(),
        ending_feeds: AtomicUsize::new(1),
    });

    let sync = NotificationSync::new(backend);
    sync.bind(Some(user_id)).await.unwrap();

    let state = wait_for_state(&sync, |s| s.error.is_some()).await;
    assert!(state.error.unwrap().contains("change feed ended"));
    assert_eq!(state.notifications.len(), 5);

    sync.refresh().await.unwrap();
    assert!(sync.state().error.is_some());

    sync.bind(Some(user_id)).await.unwrap();
    assert_eq!(inner.active_subscriptions(user_id), 1);
    assert!(sync.state().error.is_none());

    inner
        .insert(NewNotification::new(user_id, "event_starting", "Kickoff", "Hacking starts now"))
        .await
        .unwrap();
    let state = wait_for_state(&sync, |s| s.notifications.len() == 6).await;
    assert_eq!(state.unread_count, 4);
}

#[tokio::test]
async fn lagged_feed_still_catches_up() {
    let backend = InMemoryBackend::new();
    let user_id = Uuid::new_v4();

    let sync = NotificationSync::new(Arc::new(backend.clone()));
    sync.bind(Some(user_id)).await.unwrap();

    let mine = backend
        .insert(NewNotification::new(user_id, "team_invite", "Mine", "For the bound user"))
        .await
        .unwrap();
    // Other users' traffic overflows the shared change channel before the
    // feed task gets to run.
    for _ in 0..150 {
        backend
            .insert(NewNotification::new(Uuid::new_v4(), "vote_cast", "Busy", "Someone else"))
            .await
            .unwrap();
    }

    let state = wait_for_state(&sync, |s| s.notifications.iter().any(|n| n.id == mine.id)).await;
    assert_eq!(state.notifications.len(), 1);
    assert_eq!(state.unread_count, 1);
    assert_unread_consistent(&state);
}

#[tokio::test]
async fn stale_refresh_is_discarded_after_unbind() {
    let inner = InMemoryBackend::new();
    let user_id = Uuid::new_v4();
    seed_mixed(&inner, user_id);
    let backend = CountingBackend::new(inner);

    let sync = Arc::new(NotificationSync::new(backend.clone()));
    sync.bind(Some(user_id)).await.unwrap();

    let (entered, release) = backend.hold_next_fetch();
    let in_flight = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.refresh().await })
    };
    entered.await.unwrap();

    sync.unbind().await.unwrap();
    let _ = release.send(());
    in_flight.await.unwrap().unwrap();

    let state = sync.state();
    assert!(state.user_id.is_none());
    assert!(state.notifications.is_empty());
    assert_eq!(state.unread_count, 0);
    assert!(!state.loading);
}

#[tokio::test]
async fn stale_refresh_is_discarded_after_rebind() {
    let inner = InMemoryBackend::new();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    seed_mixed(&inner, first);
    inner.seed(notification(second, "second-user", false, 1));
    let backend = CountingBackend::new(inner);

    let sync = Arc::new(NotificationSync::new(backend.clone()));
    sync.bind(Some(first)).await.unwrap();

    let (entered, release) = backend.hold_next_fetch();
    let in_flight = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.refresh().await })
    };
    entered.await.unwrap();

    sync.bind(Some(second)).await.unwrap();
    let _ = release.send(());
    in_flight.await.unwrap().unwrap();

    let state = sync.state();
    assert_eq!(state.user_id, Some(second));
    assert_eq!(state.notifications.len(), 1);
    assert!(state.notifications.iter().all(|n| n.user_id == second));
    assert_unread_consistent(&state);
}
