//! Shared test helpers: scripted providers and small tools.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_core::error::{ProviderError, ToolError};
use parley_core::message::{Message, MessageToolCall};
use parley_core::provider::{
    CompletionStream, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage,
};
use parley_core::tool::{Tool, ToolRegistry};
use serde_json::{Map, Value};

/// One scripted engine reply.
#[derive(Clone)]
pub enum Scripted {
    Reply(ProviderResponse),
    Fail(ProviderError),
}

/// A mock provider that returns a sequence of scripted replies.
///
/// Each call returns the next reply in the queue. With `repeat_last`, the
/// final reply is returned forever; otherwise running out panics.
pub struct SequentialMockProvider {
    script: Vec<Scripted>,
    repeat_last: bool,
    requests: Mutex<Vec<ProviderRequest>>,
    native_tools: bool,
    context_window: Option<usize>,
}

impl SequentialMockProvider {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script,
            repeat_last: false,
            requests: Mutex::new(Vec::new()),
            native_tools: true,
            context_window: None,
        }
    }

    pub fn replies(responses: Vec<ProviderResponse>) -> Self {
        Self::new(responses.into_iter().map(Scripted::Reply).collect())
    }

    pub fn single_text(text: &str) -> Self {
        Self::replies(vec![make_text_response(text)])
    }

    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn without_native_tools(mut self) -> Self {
        self.native_tools = false;
        self
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = Some(window);
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        let index = requests.len();
        requests.push(request);

        let step = match self.script.get(index) {
            Some(step) => step.clone(),
            None if self.repeat_last && !self.script.is_empty() => {
                self.script[self.script.len() - 1].clone()
            }
            None => panic!(
                "SequentialMockProvider: no more responses (call #{index}, have {})",
                self.script.len()
            ),
        };
        match step {
            Scripted::Reply(response) => Ok(response),
            Scripted::Fail(error) => Err(error),
        }
    }

    async fn context_window(&self, _model: &str) -> Result<Option<usize>, ProviderError> {
        Ok(self.context_window)
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }
}

/// Streams one chunk, then stalls until the consumer cancels.
pub struct StallingStreamProvider {
    pub first_chunk: String,
    pub producer_saw_cancel: Arc<AtomicBool>,
}

impl StallingStreamProvider {
    pub fn new(first_chunk: &str) -> Self {
        Self {
            first_chunk: first_chunk.into(),
            producer_saw_cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait::async_trait]
impl Provider for StallingStreamProvider {
    fn name(&self) -> &str {
        "stalling_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured("streaming only".into()))
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<CompletionStream, ProviderError> {
        let (tx, token, stream) = CompletionStream::channel(8);
        let first = self.first_chunk.clone();
        let saw_cancel = self.producer_saw_cancel.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(Ok(StreamChunk {
                    content: Some(first),
                    ..Default::default()
                }))
                .await;
            token.cancelled().await;
            saw_cancel.store(true, Ordering::SeqCst);
        });
        Ok(stream)
    }
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

/// Create a response with native tool calls and optional prose.
pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_calls(thought, tool_calls),
        usage: None,
        model: "mock-model".into(),
    }
}

/// Helper to create a tool call.
pub fn make_tool_call(id: &str, name: &str, args: Value) -> MessageToolCall {
    MessageToolCall {
        id: id.into(),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

pub fn registry_with(tools: Vec<Box<dyn Tool>>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    Arc::new(registry)
}

fn text_schema(field: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": { field: { "type": "string" } },
        "required": [field]
    })
}

/// Returns its `text` argument.
pub struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes back the input"
    }
    fn parameters_schema(&self) -> Value {
        text_schema("text")
    }
    async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        Ok(arguments.get("text").cloned().unwrap_or_default())
    }
}

pub struct FailingTool;

#[async_trait::async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
    async fn invoke(&self, _arguments: Map<String, Value>) -> Result<Value, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "fail".into(),
            reason: "disk on fire".into(),
        })
    }
}

pub struct PanickingTool;

#[async_trait::async_trait]
impl Tool for PanickingTool {
    fn name(&self) -> &str {
        "panic"
    }
    fn description(&self) -> &str {
        "Always panics"
    }
    fn parameters_schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
    async fn invoke(&self, _arguments: Map<String, Value>) -> Result<Value, ToolError> {
        panic!("boom");
    }
}

pub struct SlowTool;

#[async_trait::async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "Takes far too long"
    }
    fn parameters_schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
    async fn invoke(&self, _arguments: Map<String, Value>) -> Result<Value, ToolError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

/// Terminal-for-turn: asks the user for a recording.
pub struct RecordingTool;

#[async_trait::async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        "record"
    }
    fn description(&self) -> &str {
        "Ask the user to record audio"
    }
    fn parameters_schema(&self) -> Value {
        text_schema("prompt")
    }
    async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        Ok(serde_json::json!({ "prompt": arguments.get("prompt").cloned().unwrap_or_default() }))
    }
    fn is_terminal(&self) -> bool {
        true
    }
}

/// An optional tool with a bulky schema.
pub struct BulkyOptionalTool;

#[async_trait::async_trait]
impl Tool for BulkyOptionalTool {
    fn name(&self) -> &str {
        "bulky"
    }
    fn description(&self) -> &str {
        "A rarely needed tool with a very long description"
    }
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "notes": { "type": "string", "description": "x".repeat(4_000) } }
        })
    }
    async fn invoke(&self, _arguments: Map<String, Value>) -> Result<Value, ToolError> {
        Ok(Value::Null)
    }
    fn is_optional(&self) -> bool {
        true
    }
}
