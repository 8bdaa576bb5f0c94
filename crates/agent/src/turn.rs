//! Turn inputs and outcomes as seen by the caller.

use parley_core::error::ErrorKind;
use parley_core::message::MessageToolCall;
use serde::{Deserialize, Serialize};

/// A structured terminal error for a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TurnError {
    pub kind: ErrorKind,
    pub message: String,
    /// Answer text accumulated before a deliberate halt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_answer: Option<String>,
}

impl TurnError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            partial_answer: None,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnResult {
    /// The model answered without calling tools.
    Answer { text: String },

    /// A terminal-for-turn tool handed control to the caller. Continue with
    /// `resume_turn` once its result is available.
    PendingTool {
        tool_call: MessageToolCall,
        request: serde_json::Value,
    },

    Error { detail: TurnError },
}

impl TurnResult {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            detail: TurnError::new(kind, message),
        }
    }

    pub fn answer_text(&self) -> Option<&str> {
        match self {
            Self::Answer { text } => Some(text),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Error { detail } => Some(detail.kind),
            _ => None,
        }
    }
}

/// What starts a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    /// A new user message.
    UserText(String),
    /// The externally supplied result of the pending tool call.
    Resume {
        tool_call_id: String,
        payload: serde_json::Value,
    },
}
