//! Recording request tool: asks the user to record something.
//!
//! The tool ends the turn: its payload is the request shown to the user,
//! and the recording itself comes back through `resume_turn`.

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::Tool;
use serde_json::{Map, Value};

const MEDIA_KINDS: [&str; 3] = ["audio", "video", "screen"];
const MAX_DURATION_SECS: u64 = 600;

pub struct RequestRecordingTool;

#[async_trait]
impl Tool for RequestRecordingTool {
    fn name(&self) -> &str {
        "request_recording"
    }

    fn description(&self) -> &str {
        "Ask the user to make a recording. The turn pauses until the user provides it."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "What the user should record"
                },
                "media": {
                    "type": "string",
                    "enum": MEDIA_KINDS,
                    "description": "Kind of recording (default: audio)"
                },
                "max_duration_secs": {
                    "type": "integer",
                    "description": "Upper bound on the recording length in seconds"
                }
            },
            "required": ["prompt"]
        })
    }

    async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        let prompt = arguments
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'prompt' argument".into()))?;

        let media = match arguments.get("media").and_then(Value::as_str) {
            None => "audio",
            Some(m) if MEDIA_KINDS.contains(&m) => m,
            Some(other) => {
                return Err(ToolError::InvalidArguments(format!(
                    "unsupported media '{other}', expected one of {}",
                    MEDIA_KINDS.join(", ")
                )));
            }
        };

        let max_duration = arguments
            .get("max_duration_secs")
            .and_then(Value::as_u64)
            .map_or(MAX_DURATION_SECS, |d| d.clamp(1, MAX_DURATION_SECS));

        Ok(serde_json::json!({
            "type": "recording_request",
            "prompt": prompt,
            "media": media,
            "max_duration_secs": max_duration,
        }))
    }

    fn is_terminal(&self) -> bool {
        true
    }
}
