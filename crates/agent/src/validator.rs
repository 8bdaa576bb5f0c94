//! Response validation: catch degenerate requests, output and call patterns.
//!
//! Three checks, each cheap enough to run on every iteration:
//!
//! - **token check**: the prepared request must fit the context window
//! - **gibberish check**: output dominated by one character, one repeated
//!   phrase, or far longer than any sane answer
//! - **loop check**: the same call over and over, or a short cycle of calls
//!   repeating, within a sliding window of recent calls

use std::collections::HashMap;
use std::sync::Arc;

use parley_core::error::ErrorKind;
use parley_core::provider::ProviderRequest;
use parley_core::tool::ToolCall;

use crate::context::token::TokenCounter;

/// Longest cycle the loop check looks for.
const MAX_CYCLE_PERIOD: usize = 4;

/// Below this many non-whitespace characters the dominance check is skipped.
const DOMINANCE_MIN_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("request of ~{estimated} tokens exceeds the {context_window}-token context window")]
    TokenLimit {
        estimated: usize,
        context_window: usize,
    },

    #[error("output is {chars} characters long, over the {max} character limit")]
    TooLong { chars: usize, max: usize },

    #[error("output repeats {ch:?} {run} times in a row")]
    CharacterRun { ch: char, run: usize },

    #[error("output is {percent}% the character {ch:?}")]
    DominantCharacter { ch: char, percent: usize },

    #[error("output repeats the phrase \"{phrase}\" {count} times")]
    RepeatedPhrase { phrase: String, count: usize },

    #[error("tool '{tool_name}' was called {count} times in a row with the same arguments")]
    ConsecutiveRepeats { tool_name: String, count: usize },

    #[error("a cycle of {period} tool calls repeated {cycles} times")]
    CyclicPattern { period: usize, cycles: usize },
}

impl Violation {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TokenLimit { .. } => ErrorKind::ContextOverflow,
            Self::TooLong { .. }
            | Self::CharacterRun { .. }
            | Self::DominantCharacter { .. }
            | Self::RepeatedPhrase { .. } => ErrorKind::GibberishOutput,
            Self::ConsecutiveRepeats { .. } | Self::CyclicPattern { .. } => {
                ErrorKind::LoopDetected
            }
        }
    }
}

/// Identity of a call for loop detection: name plus canonical arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSignature {
    pub tool_name: String,
    pub arguments: String,
}

impl From<&ToolCall> for CallSignature {
    fn from(call: &ToolCall) -> Self {
        Self {
            tool_name: call.name.clone(),
            arguments: call.arguments.canonical(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputPolicy {
    pub max_output_chars: usize,
    pub char_run_threshold: usize,
    pub dominant_char_ratio: f64,
    pub phrase_repeat_threshold: usize,
    pub phrase_words: usize,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self {
            max_output_chars: 32_000,
            char_run_threshold: 64,
            dominant_char_ratio: 0.6,
            phrase_repeat_threshold: 8,
            phrase_words: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPolicy {
    /// Identical consecutive calls that count as a loop.
    pub max_consecutive: usize,
    /// Cycle repetitions that count as a loop.
    pub pattern_threshold: usize,
    /// How many recent calls are inspected.
    pub window: usize,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            max_consecutive: 5,
            pattern_threshold: 3,
            window: 12,
        }
    }
}

pub struct ResponseValidator {
    counter: Arc<dyn TokenCounter>,
    output: OutputPolicy,
    loops: LoopPolicy,
}

impl ResponseValidator {
    pub fn new(counter: Arc<dyn TokenCounter>, output: OutputPolicy, loops: LoopPolicy) -> Self {
        Self {
            counter,
            output,
            loops,
        }
    }

    /// Token check on a fully prepared request, tool schemas included.
    pub fn validate(&self, request: &ProviderRequest, context_window: usize) -> Result<(), Violation> {
        let estimated =
            self.counter.count_messages(&request.messages) + self.counter.count_tools(&request.tools);
        if estimated > context_window {
            return Err(Violation::TokenLimit {
                estimated,
                context_window,
            });
        }
        Ok(())
    }

    /// Gibberish check on cleaned model output.
    pub fn validate_output(&self, text: &str) -> Result<(), Violation> {
        let policy = &self.output;

        let chars = text.chars().count();
        if chars > policy.max_output_chars {
            return Err(Violation::TooLong {
                chars,
                max: policy.max_output_chars,
            });
        }

        let mut counts: HashMap<char, usize> = HashMap::new();
        let mut run: Option<(char, usize)> = None;
        for ch in text.chars() {
            if ch.is_whitespace() {
                run = None;
                continue;
            }
            *counts.entry(ch).or_default() += 1;
            run = match run {
                Some((prev, n)) if prev == ch => Some((ch, n + 1)),
                _ => Some((ch, 1)),
            };
            if let Some((ch, n)) = run
                && n >= policy.char_run_threshold
            {
                return Err(Violation::CharacterRun { ch, run: n });
            }
        }

        let visible: usize = counts.values().sum();
        if visible >= DOMINANCE_MIN_CHARS
            && let Some((&ch, &count)) = counts.iter().max_by_key(|(_, n)| **n)
            && count as f64 / visible as f64 > policy.dominant_char_ratio
        {
            return Err(Violation::DominantCharacter {
                ch,
                percent: count * 100 / visible,
            });
        }

        let words: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
        let n = policy.phrase_words;
        if n > 0 && words.len() > n * policy.phrase_repeat_threshold {
            let mut phrases: HashMap<&[String], usize> = HashMap::new();
            for window in words.windows(n) {
                *phrases.entry(window).or_default() += 1;
            }
            if let Some((phrase, &count)) = phrases.iter().max_by_key(|(_, c)| **c)
                && count > policy.phrase_repeat_threshold
            {
                return Err(Violation::RepeatedPhrase {
                    phrase: phrase.join(" "),
                    count,
                });
            }
        }

        Ok(())
    }

    /// Loop check on the calls made so far this turn, oldest first.
    pub fn validate_call_sequence(&self, recent: &[CallSignature]) -> Result<(), Violation> {
        let policy = &self.loops;
        let start = recent.len().saturating_sub(policy.window);
        let recent = &recent[start..];
        let Some(last) = recent.last() else {
            return Ok(());
        };

        let consecutive = recent.iter().rev().take_while(|s| *s == last).count();
        if consecutive >= policy.max_consecutive {
            return Err(Violation::ConsecutiveRepeats {
                tool_name: last.tool_name.clone(),
                count: consecutive,
            });
        }

        for period in 2..=MAX_CYCLE_PERIOD {
            if recent.len() < period * policy.pattern_threshold {
                continue;
            }
            let cycle = &recent[recent.len() - period..];
            if cycle.iter().all(|s| s == &cycle[0]) {
                continue;
            }
            let cycles = recent
                .rchunks_exact(period)
                .take_while(|chunk| *chunk == cycle)
                .count();
            if cycles >= policy.pattern_threshold {
                return Err(Violation::CyclicPattern { period, cycles });
            }
        }

        Ok(())
    }
}
