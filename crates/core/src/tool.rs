//! Tool trait: the abstraction over external capabilities.
//!
//! Tools are what let the model act mid-conversation: analyse text, ask
//! the user for a recording, generate a file. The registry is closed: tools
//! are validated when registered and looked up by name at dispatch time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ErrorKind, ToolError};
use crate::message::{Message, MessageToolCall};
use crate::provider::ToolDefinition;

/// Arguments of a parsed tool call.
///
/// Invalid arguments do not abort parsing: they are carried to the executor,
/// which answers with a `MALFORMED_ARGUMENTS` result so the model can retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolArguments {
    Valid {
        values: serde_json::Map<String, serde_json::Value>,
    },
    Invalid {
        raw: String,
        reason: String,
    },
}

impl ToolArguments {
    /// Parse a raw JSON argument string. Empty input means "no arguments".
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Valid {
                values: serde_json::Map::new(),
            };
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => Self::from_value(value, raw),
            Err(e) => Self::Invalid {
                raw: raw.to_string(),
                reason: format!("arguments are not valid JSON: {e}"),
            },
        }
    }

    /// Normalize an already-decoded JSON value.
    ///
    /// Objects are accepted as-is, `null` becomes an empty map, and a string
    /// is decoded once more (some models double-encode their arguments).
    pub fn from_value(value: serde_json::Value, raw: &str) -> Self {
        match value {
            serde_json::Value::Object(values) => Self::Valid { values },
            serde_json::Value::Null => Self::Valid {
                values: serde_json::Map::new(),
            },
            serde_json::Value::String(inner) => {
                match serde_json::from_str::<serde_json::Value>(&inner) {
                    Ok(serde_json::Value::Object(values)) => Self::Valid { values },
                    _ => Self::Invalid {
                        raw: raw.to_string(),
                        reason: "arguments must be a JSON object".into(),
                    },
                }
            }
            _ => Self::Invalid {
                raw: raw.to_string(),
                reason: "arguments must be a JSON object".into(),
            },
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// Canonical text form: sorted-key JSON for valid arguments, the raw
    /// text otherwise.
    pub fn canonical(&self) -> String {
        match self {
            Self::Valid { values } => {
                let mut out = String::new();
                write_sorted(&mut out, &serde_json::Value::Object(values.clone()));
                out
            }
            Self::Invalid { raw, .. } => raw.clone(),
        }
    }
}

// Key order of `serde_json::Map` depends on the `preserve_order` feature,
// so canonical output sorts keys explicitly.
fn write_sorted(out: &mut String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_sorted(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_sorted(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A structured request, emitted by the model, to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the engine's tool_call.id when native)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    pub arguments: ToolArguments,
}

impl ToolCall {
    /// Rebuild a call from its wire form.
    pub fn from_wire(call: &MessageToolCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: ToolArguments::parse(&call.arguments),
        }
    }

    /// The form stored on the assistant message.
    pub fn to_wire(&self) -> MessageToolCall {
        MessageToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.canonical(),
        }
    }
}

/// How a tool call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        payload: serde_json::Value,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

/// The result paired with exactly one `ToolCall`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(call: &ToolCall, payload: serde_json::Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            outcome: ToolOutcome::Success { payload },
        }
    }

    pub fn error(
        call: &ToolCall,
        kind: ErrorKind,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            outcome: ToolOutcome::Error {
                kind,
                message: message.into(),
                details,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            ToolOutcome::Error { kind, .. } => Some(*kind),
            ToolOutcome::Success { .. } => None,
        }
    }

    /// Text fed back to the model.
    pub fn render(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { payload } => match payload {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Error {
                kind,
                message,
                details,
            } => {
                let mut error = serde_json::json!({
                    "kind": kind,
                    "message": message,
                });
                if let Some(details) = details {
                    error["details"] = details.clone();
                }
                serde_json::json!({ "error": error }).to_string()
            }
        }
    }

    pub fn to_message(&self) -> Message {
        Message::tool_result(&self.tool_call_id, &self.tool_name, self.render())
    }
}

/// The core Tool trait.
///
/// Each capability implements this trait and is registered in the
/// `ToolRegistry`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "text_stats").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Invoke the tool with validated arguments.
    ///
    /// For terminal tools the payload is the request shown to the user;
    /// the actual result arrives later through `resume_turn`.
    async fn invoke(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// Whether a call to this tool ends the turn and hands control to the user.
    fn is_terminal(&self) -> bool {
        false
    }

    /// Whether the schema may be left out of a request when the window is tight.
    fn is_optional(&self) -> bool {
        false
    }

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// The tool catalog. Read-only once built, so it is shared across sessions
/// behind an `Arc`.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a tool after validating its name and schema.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> std::result::Result<(), ToolError> {
        let name = tool.name().to_string();
        validate_name(&name)?;
        if self.index.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }

        let schema = tool.parameters_schema();
        if schema.get("type").and_then(|t| t.as_str()) != Some("object") {
            return Err(ToolError::InvalidDefinition {
                tool_name: name,
                reason: "parameter schema must be a JSON object schema (\"type\": \"object\")"
                    .into(),
            });
        }

        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.index.get(name).map(|&i| self.tools[i].as_ref())
    }

    /// All tool definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    /// Definitions without the tools marked optional.
    pub fn essential_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| !t.is_optional())
            .map(|t| t.to_definition())
            .collect()
    }

    pub fn has_optional(&self) -> bool {
        self.tools.iter().any(|t| t.is_optional())
    }

    /// List all registered tool names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_name(name: &str) -> std::result::Result<(), ToolError> {
    let well_formed = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if well_formed {
        Ok(())
    } else {
        Err(ToolError::InvalidDefinition {
            tool_name: name.to_string(),
            reason: "name must be 1-64 characters of [A-Za-z0-9_-]".into(),
        })
    }
}
