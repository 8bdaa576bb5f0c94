//! Session domain types and the `SessionStore` trait.
//!
//! A session is one ongoing conversation. It is created lazily on first
//! contact, grows append-only turn by turn, and is never deleted here:
//! eviction is the embedding application's concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::{Message, MessageToolCall, Role};

/// Opaque identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A terminal-for-turn tool call the session is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTool {
    /// The call that handed control to the user.
    pub call: MessageToolCall,
    /// What the tool asked the user for (shown by the caller).
    pub request: serde_json::Value,
}

/// A conversation: an ordered, append-only sequence of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// Ordered messages. Never reordered, only truncated for transmission.
    pub messages: Vec<Message>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Set while a terminal-for-turn tool awaits `resume_turn`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool: Option<PendingTool>,
}

impl Session {
    /// Create a new empty session.
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            pending_tool: None,
        }
    }

    /// Append a message.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// Tool calls from the most recent assistant message that have no
    /// matching tool result after it.
    pub fn unresolved_tool_calls(&self) -> Vec<MessageToolCall> {
        let Some(pos) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
        else {
            return Vec::new();
        };

        let resolved: Vec<&str> = self.messages[pos + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        self.messages[pos]
            .tool_calls
            .iter()
            .filter(|tc| !resolved.contains(&tc.id.as_str()))
            .cloned()
            .collect()
    }
}

/// Storage for per-session message history.
///
/// The store does not serialise writers: the orchestrator guarantees at
/// most one turn per session is in flight.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session, creating an empty one on first contact.
    async fn load(&self, id: &SessionId) -> Result<Session, StoreError>;

    /// Append one message. The only way history grows.
    async fn append(&self, id: &SessionId, message: Message) -> Result<(), StoreError>;

    /// The ordered message history.
    async fn history(&self, id: &SessionId) -> Result<Vec<Message>, StoreError>;

    /// Record (or clear) the tool call the session is waiting on.
    async fn set_pending(
        &self,
        id: &SessionId,
        pending: Option<PendingTool>,
    ) -> Result<(), StoreError>;

    /// Forget all messages of a session.
    async fn reset(&self, id: &SessionId) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> MessageToolCall {
        MessageToolCall {
            id: id.into(),
            name: "text_stats".into(),
            arguments: "{}".into(),
        }
    }

    #[test]
    fn session_tracks_updates() {
        let mut session = Session::new(SessionId::from("s1"));
        let created = session.created_at;
        session.push(Message::user("First message"));
        assert_eq!(session.messages.len(), 1);
        assert!(session.updated_at >= created);
    }

    #[test]
    fn unresolved_calls_exclude_answered_ones() {
        let mut session = Session::new(SessionId::new());
        session.push(Message::user("go"));
        session.push(Message::assistant_with_calls("", vec![call("a"), call("b"), call("c")]));
        session.push(Message::tool_result("b", "text_stats", "ok"));

        let open: Vec<String> = session
            .unresolved_tool_calls()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(open, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn no_assistant_means_nothing_unresolved() {
        let mut session = Session::new(SessionId::new());
        session.push(Message::user("hello"));
        assert!(session.unresolved_tool_calls().is_empty());
    }
}
