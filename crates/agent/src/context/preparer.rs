//! Message preparation: fit a session's history into the token budget.
//!
//! # Algorithm
//!
//! 1. System messages are always kept. They are part of the fixed overhead
//!    the budget was computed with, so they are not counted here.
//! 2. The current turn (the latest user message and everything after it)
//!    is protected.
//! 3. Older messages are grouped into units (an assistant message with tool
//!    calls travels with its tool results) and dropped oldest-first until
//!    the rest fits `available_for_history`.
//! 4. If the protected turn alone does not fit, the result is an overflow.
//!
//! Messages are counted in the shape they are sent in: with inline tool
//! injection, tool calls and results cost what their markup costs.
//!
//! Aggressive mode additionally drops every unit before the current turn
//! and cuts long tool results inside it.

use std::sync::Arc;

use parley_core::message::{Message, Role};
use tracing::debug;

use crate::context::budget::TokenBudget;
use crate::context::token::TokenCounter;
use crate::injector::{InjectionMode, inline_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    Normal,
    /// Second attempt after an overflow or an engine failure.
    Aggressive,
}

/// The outgoing message list and what it cost.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub messages: Vec<Message>,
    /// Estimated tokens of the non-system messages.
    pub history_tokens: usize,
    /// Number of messages left out.
    pub dropped: usize,
}

/// Even the protected part of the history exceeds the budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("the current turn needs ~{required} tokens but only {available} are available for history")]
pub struct OverflowError {
    pub required: usize,
    pub available: usize,
}

pub struct MessagePreparer {
    counter: Arc<dyn TokenCounter>,
    aggressive_tool_result_chars: usize,
    injection: InjectionMode,
}

impl MessagePreparer {
    pub fn new(counter: Arc<dyn TokenCounter>, aggressive_tool_result_chars: usize) -> Self {
        Self {
            counter,
            aggressive_tool_result_chars,
            injection: InjectionMode::Native,
        }
    }

    /// Count messages the way `mode` will rewrite them before sending.
    pub fn with_injection_mode(mut self, mode: InjectionMode) -> Self {
        self.injection = mode;
        self
    }

    pub fn prepare(
        &self,
        history: &[Message],
        budget: &TokenBudget,
        mode: PrepareMode,
    ) -> Result<Prepared, OverflowError> {
        let available = budget.available_for_history;
        let protected_from = protected_start(history);

        let mut protected: Vec<Message> = history[protected_from..].to_vec();
        if mode == PrepareMode::Aggressive {
            for message in protected.iter_mut().filter(|m| m.role == Role::Tool) {
                truncate_chars(&mut message.content, self.aggressive_tool_result_chars);
            }
        }

        let protected_tokens = self.count_history(&protected);
        if protected_tokens > available {
            return Err(OverflowError {
                required: protected_tokens,
                available,
            });
        }

        let units = droppable_units(&history[..protected_from]);
        let mut unit_tokens: Vec<usize> = units
            .iter()
            .map(|u| self.count_history(&history[u.clone()]))
            .collect();
        let mut total = protected_tokens + unit_tokens.iter().sum::<usize>();

        // Index of the first unit that survives.
        let mut first_kept = 0;
        let drop_all = mode == PrepareMode::Aggressive;
        while first_kept < units.len() && (drop_all || total > available) {
            total -= unit_tokens[first_kept];
            unit_tokens[first_kept] = 0;
            first_kept += 1;
        }

        let dropped_ranges = &units[..first_kept];
        let mut messages = Vec::with_capacity(history.len());
        let mut dropped = 0;
        for (i, message) in history[..protected_from].iter().enumerate() {
            if message.role != Role::System && dropped_ranges.iter().any(|r| r.contains(&i)) {
                dropped += 1;
                continue;
            }
            messages.push(message.clone());
        }
        messages.extend(protected);

        if dropped > 0 {
            debug!(dropped, tokens = total, available, "Truncated history");
        }

        Ok(Prepared {
            messages,
            history_tokens: total,
            dropped,
        })
    }

    /// Estimated tokens of the messages that count against the budget.
    fn count_history(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| self.count_message(m))
            .sum()
    }

    fn count_message(&self, message: &Message) -> usize {
        let rewritten = self.injection == InjectionMode::Inline
            && (message.role == Role::Tool || message.has_tool_calls());
        if rewritten {
            let mut wire = message.clone();
            inline_message(&mut wire);
            self.counter.count_message(&wire)
        } else {
            self.counter.count_message(message)
        }
    }
}

/// Start of the current turn: the latest user message, or the last message
/// if there is none.
fn protected_start(history: &[Message]) -> usize {
    history
        .iter()
        .rposition(|m| m.role == Role::User)
        .or_else(|| history.iter().rposition(|m| m.role != Role::System))
        .unwrap_or(history.len())
}

/// Group non-system messages into units that must be dropped together.
///
/// A tool result joins the unit of the message before it, so an assistant
/// tool-call message is never kept without its results or vice versa.
/// System messages interleaved in a unit are kept regardless.
fn droppable_units(messages: &[Message]) -> Vec<std::ops::Range<usize>> {
    let mut units: Vec<std::ops::Range<usize>> = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        match message.role {
            Role::System => {}
            Role::Tool if !units.is_empty() => {
                if let Some(last) = units.last_mut() {
                    last.end = i + 1;
                }
            }
            _ => units.push(i..i + 1),
        }
    }
    units
}

fn truncate_chars(content: &mut String, max_chars: usize) {
    if let Some((cut, _)) = content.char_indices().nth(max_chars) {
        let omitted = content[cut..].chars().count();
        content.truncate(cut);
        content.push_str(&format!("\n[... {omitted} characters truncated]"));
    }
}
