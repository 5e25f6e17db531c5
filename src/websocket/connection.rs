use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Tracks open WebSocket sync sessions by session id.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<Uuid, Uuid>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Register a session for `user_id`; returns the new session id
    pub fn open(&self, user_id: Uuid) -> Uuid {
        let session_id = Uuid::new_v4();
        self.sessions.insert(session_id, user_id);
        tracing::info!("Session {} opened for user {}", session_id, user_id);
        session_id
    }

    pub fn close(&self, session_id: &Uuid) {
        if let Some((_, user_id)) = self.sessions.remove(session_id) {
            tracing::info!("Session {} closed for user {}", session_id, user_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
