use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Live sessions, for health reporting. Session state itself stays inside each
/// session's task; this only records that a session exists.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, DateTime<Utc>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: Uuid) {
        self.sessions.insert(session_id, Utc::now());
    }

    pub fn remove(&self, session_id: &Uuid) {
        self.sessions.remove(session_id);
    }

    pub fn contains(&self, session_id: &Uuid) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn connected_at(&self, session_id: &Uuid) -> Option<DateTime<Utc>> {
        self.sessions.get(session_id).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
