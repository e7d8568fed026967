use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Translating,
    Guarding,
    Executing,
    Closed,
}

impl SessionPhase {
    /// Status text announced when a pipeline stage starts.
    pub fn status_text(&self) -> Option<&'static str> {
        match self {
            SessionPhase::Translating => Some("Translating your question…"),
            SessionPhase::Guarding => Some("Checking the generated SQL…"),
            SessionPhase::Executing => Some("Running query…"),
            SessionPhase::Idle | SessionPhase::Closed => None,
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Translating => "translating",
            SessionPhase::Guarding => "guarding",
            SessionPhase::Executing => "executing",
            SessionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-connection state, owned by the session task alone.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub pending_query: Option<String>,
    pub phase: SessionPhase,
}

impl SessionState {
    pub fn new(session_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            connected_at: now,
            last_activity_at: now,
            pending_query: None,
            phase: SessionPhase::Idle,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn is_idle(&self) -> bool {
        self.phase == SessionPhase::Idle
    }
}
