//! Tool-call parsing.
//!
//! Two strategies, tried in order:
//!
//! 1. **Native**: structured calls the engine returned next to the text.
//! 2. **Embedded**: calls the model wrote as markup inside the text, for
//!    engines without native support. Recognised dialects:
//!    - `<tool_call>{"name": ..., "arguments": {...}}</tool_call>`
//!    - `<tool>{...}</tool>`
//!    - a trailing `<tool_call>{...}` the model never closed
//!
//! Both normalise to the same [`ToolCall`] shape. Markup is always stripped
//! from the returned text, whichever strategy won. Broken arguments never
//! fail the parse: the call is kept with its arguments marked invalid.

use std::collections::HashSet;
use std::sync::OnceLock;

use parley_core::message::MessageToolCall;
use parley_core::tool::{ToolArguments, ToolCall};
use regex_lite::Regex;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Which strategy produced the calls of a generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCalls {
    Native(Vec<ToolCall>),
    Embedded(Vec<ToolCall>),
    None,
}

impl ParsedCalls {
    pub fn calls(&self) -> &[ToolCall] {
        match self {
            Self::Native(calls) | Self::Embedded(calls) => calls,
            Self::None => &[],
        }
    }

    pub fn into_calls(self) -> Vec<ToolCall> {
        match self {
            Self::Native(calls) | Self::Embedded(calls) => calls,
            Self::None => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls().is_empty()
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Embedded(_) => "embedded",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    /// User-facing prose with all tool-call markup removed.
    pub cleaned_text: String,
    pub calls: ParsedCalls,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCallParser;

impl ToolCallParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, text: &str, native: &[MessageToolCall]) -> ParsedOutput {
        // An unclosed tag ends the prose only when it actually carries a call.
        let trailing = trailing_open_block(text)
            .and_then(|(start, payload)| parse_payload(payload).map(|call| (start, call)));
        let (prose, trailing_call) = match trailing {
            Some((start, call)) => (&text[..start], Some(call)),
            None => (text, None),
        };

        let mut embedded = extract_closed_blocks(prose);
        embedded.extend(trailing_call);
        let cleaned_text = strip_markup(prose);

        let calls = if !native.is_empty() {
            if !embedded.is_empty() {
                debug!(
                    embedded = embedded.len(),
                    "Native tool calls present, ignoring embedded markup"
                );
            }
            ParsedCalls::Native(assign_ids(native.iter().map(ToolCall::from_wire).collect()))
        } else if !embedded.is_empty() {
            ParsedCalls::Embedded(assign_ids(embedded))
        } else {
            ParsedCalls::None
        };

        ParsedOutput {
            cleaned_text,
            calls,
        }
    }
}

/// Byte offset of the first complete tool-call open tag in `text`.
///
/// Only `<tool>` and `<tool_call>` count: `<toolbar>` or `<tools>` are prose.
pub fn find_tool_markup(text: &str) -> Option<usize> {
    open_tag_regex()?.find(text).map(|m| m.start())
}

fn extract_closed_blocks(text: &str) -> Vec<ToolCall> {
    let mut blocks: Vec<(usize, &str)> = Vec::new();
    for regex in [tool_call_block_regex(), tool_block_regex()].into_iter().flatten() {
        for captures in regex.captures_iter(text) {
            if let (Some(whole), Some(payload)) = (captures.get(0), captures.name("payload")) {
                blocks.push((whole.start(), payload.as_str()));
            }
        }
    }
    blocks.sort_by_key(|(start, _)| *start);

    blocks
        .into_iter()
        .filter_map(|(_, payload)| parse_payload(payload))
        .collect()
}

/// Start and payload of an open tag with no closing tag after it.
fn trailing_open_block(text: &str) -> Option<(usize, &str)> {
    let after_last_close = close_tag_regex()
        .and_then(|re| re.find_iter(text).last())
        .map_or(0, |m| m.end());
    let rest = &text[after_last_close..];
    let open = open_tag_regex()?.find(rest)?;
    Some((after_last_close + open.start(), &rest[open.end()..]))
}

fn parse_payload(payload: &str) -> Option<ToolCall> {
    let body = strip_code_fence(payload.trim());
    if body.is_empty() {
        warn!("Empty tool-call block, stripping it");
        return None;
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => {
            let Some(name) = map
                .get("name")
                .or_else(|| map.get("tool"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty())
            else {
                warn!("Tool-call block without a tool name, stripping it");
                return None;
            };

            let arguments = match map
                .get("arguments")
                .or_else(|| map.get("args"))
                .or_else(|| map.get("parameters"))
            {
                Some(value) => ToolArguments::from_value(value.clone(), &value.to_string()),
                None => ToolArguments::Valid {
                    values: serde_json::Map::new(),
                },
            };

            let id = map
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            Some(ToolCall {
                id,
                name: name.to_string(),
                arguments,
            })
        }
        Ok(_) => {
            warn!("Tool-call block is not a JSON object, stripping it");
            None
        }
        Err(e) => match salvage_name(body) {
            Some(name) => {
                debug!(tool = %name, "Tool-call block has broken JSON, keeping the call");
                Some(ToolCall {
                    id: String::new(),
                    name,
                    arguments: ToolArguments::Invalid {
                        raw: body.to_string(),
                        reason: format!("tool call is not valid JSON: {e}"),
                    },
                })
            }
            None => {
                warn!(error = %e, "Unrecoverable tool-call block, no call taken from it");
                None
            }
        },
    }
}

fn salvage_name(body: &str) -> Option<String> {
    let captures = name_field_regex()?.captures(body)?;
    let name = captures.name("name")?.as_str().trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn strip_code_fence(body: &str) -> &str {
    let Some(inner) = body.strip_prefix("```") else {
        return body;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Give every call a unique, non-empty id.
fn assign_ids(mut calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    for call in &mut calls {
        if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
            call.id = new_call_id();
            seen.insert(call.id.clone());
        }
    }
    calls
}

fn new_call_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..12])
}

fn strip_markup(text: &str) -> String {
    let mut stripped = text.to_string();
    for regex in [tool_call_block_regex(), tool_block_regex()].into_iter().flatten() {
        stripped = regex.replace_all(&stripped, "").into_owned();
    }
    if let Some(regex) = close_tag_regex() {
        stripped = regex.replace_all(&stripped, "").into_owned();
    }
    if let Some(regex) = blank_lines_regex() {
        stripped = regex.replace_all(&stripped, "\n\n").into_owned();
    }
    stripped.trim().to_string()
}

fn tool_call_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        compile_regex(
            r"(?is)<tool_call\b[^>]*>(?P<payload>.*?)</tool_call\s*>",
            "tool_call_block",
        )
    })
    .as_ref()
}

fn tool_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| compile_regex(r"(?is)<tool\b[^>]*>(?P<payload>.*?)</tool\s*>", "tool_block"))
        .as_ref()
}

fn open_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| compile_regex(r"(?i)<(tool_call|tool)\b[^>]*>", "open_tag"))
        .as_ref()
}

fn close_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| compile_regex(r"(?i)</(tool_call|tool)\s*>", "close_tag"))
        .as_ref()
}

fn name_field_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| compile_regex(r#""(?:name|tool)"\s*:\s*"(?P<name>[^"]+)""#, "name_field"))
        .as_ref()
}

fn blank_lines_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| compile_regex(r"\n{3,}", "blank_lines"))
        .as_ref()
}

fn compile_regex(pattern: &str, label: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            error!("invalid tool-call regex {label}: {err}");
            None
        }
    }
}
