//! Tool execution.
//!
//! Every call produces exactly one outcome and nothing escapes: unknown
//! tools, invalid arguments, tool errors, panics and timeouts all become
//! structured error results the model can read and react to.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parley_core::error::ErrorKind;
use parley_core::session::PendingTool;
use parley_core::tool::{ToolArguments, ToolCall, ToolRegistry, ToolResult};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// What happened to a call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(ToolResult),
    /// A terminal-for-turn tool accepted the call; the result comes later.
    Deferred(PendingTool),
}

pub struct ToolExecutor {
    tools: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(tools: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { tools, timeout }
    }

    pub async fn execute(&self, call: &ToolCall) -> ExecutionOutcome {
        let values = match &call.arguments {
            ToolArguments::Valid { values } => values.clone(),
            ToolArguments::Invalid { raw, reason } => {
                debug!(tool = %call.name, "Rejecting malformed arguments");
                return ExecutionOutcome::Completed(ToolResult::error(
                    call,
                    ErrorKind::MalformedArguments,
                    reason.clone(),
                    Some(serde_json::json!({ "raw": raw })),
                ));
            }
        };

        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "Model called an unknown tool");
            return ExecutionOutcome::Completed(ToolResult::error(
                call,
                ErrorKind::UnknownTool,
                format!("no tool named '{}'", call.name),
                Some(serde_json::json!({ "available": self.tools.names() })),
            ));
        };

        if let Err(problems) = validate_arguments(&tool.parameters_schema(), &values) {
            return ExecutionOutcome::Completed(ToolResult::error(
                call,
                ErrorKind::MalformedArguments,
                format!("arguments do not match the schema of '{}'", call.name),
                Some(serde_json::json!({ "problems": problems })),
            ));
        }

        let invocation = AssertUnwindSafe(tool.invoke(values)).catch_unwind();
        let failure = match tokio::time::timeout(self.timeout, invocation).await {
            Ok(Ok(Ok(payload))) => {
                return if tool.is_terminal() {
                    debug!(tool = %call.name, "Deferring terminal tool to the caller");
                    ExecutionOutcome::Deferred(PendingTool {
                        call: call.to_wire(),
                        request: payload,
                    })
                } else {
                    ExecutionOutcome::Completed(ToolResult::success(call, payload))
                };
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(panic)) => format!("tool panicked: {}", panic_message(panic.as_ref())),
            Err(_) => format!("tool timed out after {}s", self.timeout.as_secs_f64()),
        };

        warn!(tool = %call.name, error = %failure, "Tool execution failed");
        ExecutionOutcome::Completed(ToolResult::error(
            call,
            ErrorKind::ExecutionFailed,
            failure,
            Some(serde_json::json!({ "tool": call.name })),
        ))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

/// Check required properties and declared primitive types.
///
/// Only the top level of the schema is checked: nested `properties` of
/// object arguments and array `items` are not validated, and unknown
/// keywords are ignored.
pub fn validate_arguments(schema: &Value, arguments: &Map<String, Value>) -> Result<(), Vec<String>> {
    let mut problems = Vec::new();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !arguments.contains_key(name) {
                problems.push(format!("missing required argument '{name}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in arguments {
            let Some(declared) = properties.get(name).and_then(|p| p.get("type")) else {
                continue;
            };
            let allowed: Vec<&str> = match declared {
                Value::String(t) => vec![t.as_str()],
                Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
                _ => continue,
            };
            if !allowed.iter().any(|t| matches_type(t, value)) {
                problems.push(format!(
                    "argument '{name}' should be {}, got {}",
                    allowed.join(" or "),
                    type_name(value)
                ));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn matches_type(declared: &str, value: &Value) -> bool {
    match declared {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
