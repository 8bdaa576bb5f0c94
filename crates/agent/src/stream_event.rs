//! Turn-level streaming events.
//!
//! `TurnEvent` wraps what the orchestrator does during a turn into events a
//! caller can render as they happen: answer text as it is generated, tool
//! calls and their results, and the final [`TurnResult`].

use serde::{Deserialize, Serialize};

use crate::parser::{ToolCallParser, find_tool_markup};
use crate::turn::TurnResult;

/// Tag names that open an embedded tool call.
const TAG_NAMES: [&str; 2] = ["tool_call", "tool"];

/// Events emitted while a turn runs.
///
/// - `text_delta` : partial answer text from the engine
/// - `tool_call`  : the model is invoking a tool
/// - `tool_result`: a tool call finished
/// - `discarded`  : text streamed so far belongs to a dropped generation
/// - `done`       : the turn is over; always the last event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TextDelta { content: String },

    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },

    ToolResult {
        id: String,
        name: String,
        success: bool,
        output: String,
    },

    /// The engine's output was thrown away (retry or gibberish).
    Discarded { reason: String },

    Done { result: TurnResult },
}

impl TurnEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Discarded { .. } => "discarded",
            Self::Done { .. } => "done",
        }
    }
}

/// Forwards streamed text up to the first embedded tool-call tag.
///
/// A trailing fragment that could still grow into a tag is held back until
/// the next delta decides it. Text after a tag is held to the end of the
/// generation and released only if it carried no call after all.
#[derive(Debug, Default)]
pub struct DeltaGate {
    held: String,
    closed: bool,
}

impl DeltaGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta; returns the text that is safe to show, if any.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.held.push_str(delta);
        if self.closed {
            return None;
        }

        if let Some(pos) = find_tool_markup(&self.held) {
            self.closed = true;
            let visible: String = self.held.drain(..pos).collect();
            return non_empty(visible);
        }

        let keep_from = pending_tag_start(&self.held).unwrap_or(self.held.len());
        let visible: String = self.held.drain(..keep_from).collect();
        non_empty(visible)
    }

    /// Release whatever is still held once the generation ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.held);
        if self.closed && !ToolCallParser::new().parse(&rest, &[]).calls.is_empty() {
            return None;
        }
        non_empty(rest)
    }
}

// Start of a trailing `<...` that may still become a tool-call open tag.
fn pending_tag_start(text: &str) -> Option<usize> {
    let start = text.rfind('<')?;
    let tail = text[start + 1..].to_ascii_lowercase();
    let may_grow = TAG_NAMES.iter().any(|name| {
        name.starts_with(tail.as_str())
            || tail.strip_prefix(name).is_some_and(|rest| {
                !rest.contains('>') && !rest.starts_with(|c: char| c.is_alphanumeric() || c == '_')
            })
    });
    may_grow.then_some(start)
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}
