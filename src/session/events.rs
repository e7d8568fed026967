//! Wire shapes of the session protocol: every frame is `{"event": ..., "content": ...}`.

use crate::error::GenieError;
use crate::executor::Scalar;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlResultPayload {
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
    pub row_count: usize,
    pub truncated: bool,
    /// Rendered table for clients that only display text.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "content", rename_all = "snake_case")]
pub enum OutboundEvent {
    Status(String),
    SqlResult(SqlResultPayload),
    Chat(String),
    Message(String),
    Error(String),
}

impl OutboundEvent {
    /// Error event carrying only the category and the user-facing message.
    pub fn error(err: &GenieError) -> Self {
        OutboundEvent::Error(format!("{}: {}", err.category(), err.user_message()))
    }

    pub fn busy(queue_depth: usize) -> Self {
        OutboundEvent::Error(format!(
            "busy: {} questions are already waiting; this one was not queued. Please wait for the current answers.",
            queue_depth
        ))
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Status(_) => "status",
            OutboundEvent::SqlResult(_) => "sql_result",
            OutboundEvent::Chat(_) => "chat",
            OutboundEvent::Message(_) => "message",
            OutboundEvent::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"event":"error","content":"internal: could not encode event"}"#.to_string()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "content", rename_all = "snake_case")]
pub enum InboundEvent {
    ClientMessage(String),
}

impl InboundEvent {
    /// Accepts a JSON frame or, failing that, treats the frame as bare message text.
    pub fn from_frame(frame: &str) -> Self {
        serde_json::from_str(frame).unwrap_or_else(|_| InboundEvent::ClientMessage(frame.to_string()))
    }

    pub fn text(&self) -> &str {
        match self {
            InboundEvent::ClientMessage(text) => text,
        }
    }
}
