//! Token estimation.
//!
//! No tokenizer is mandated: counting goes through the [`TokenCounter`]
//! trait so an engine-specific tokenizer can be plugged in. The default is a
//! character heuristic (~4 characters per token, rounded up) which is
//! within ~10% for BPE tokenizers on English text.

use parley_core::message::Message;
use parley_core::provider::ToolDefinition;

/// Estimates how many tokens a piece of content costs.
pub trait TokenCounter: Send + Sync {
    /// Tokens for raw text.
    fn count_text(&self, text: &str) -> usize;

    /// Fixed framing cost of one message (role name, delimiters).
    fn message_overhead(&self) -> usize;

    /// Tokens for one message, including overhead and any tool calls it carries.
    fn count_message(&self, message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|tc| self.count_text(&tc.name) + self.count_text(&tc.arguments))
            .sum();
        self.message_overhead() + self.count_text(&message.content) + calls
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }

    /// Tokens for tool definitions passed through the native tool field.
    fn count_tools(&self, tools: &[ToolDefinition]) -> usize {
        tools
            .iter()
            .map(|t| self.count_text(&serde_json::to_string(t).unwrap_or_default()))
            .sum()
    }
}

/// Conservative character-based heuristic.
#[derive(Debug, Clone, Copy)]
pub struct CharHeuristic {
    chars_per_token: usize,
    message_overhead: usize,
}

impl CharHeuristic {
    pub fn new(chars_per_token: usize, message_overhead: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
            message_overhead,
        }
    }
}

impl Default for CharHeuristic {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

impl TokenCounter for CharHeuristic {
    fn count_text(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }

    fn message_overhead(&self) -> usize {
        self.message_overhead
    }
}
