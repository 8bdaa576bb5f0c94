//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, llama.cpp server, and any
//! endpoint exposing `/v1/chat/completions`.
//!
//! Supports:
//! - Chat completions (blocking and streaming SSE)
//! - Native tool calls
//! - Context window discovery from `/models`

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::error::ProviderError;
use parley_core::message::{Message, MessageToolCall, Role};
use parley_core::provider::{
    CompletionStream, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition,
    Usage,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_BUFFER: usize = 64;

/// An OpenAI-compatible completion engine.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a provider for `base_url` (e.g. `https://api.openai.com/v1`).
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
        })
    }

    /// OpenAI itself.
    pub fn openai(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openai", "https://api.openai.com/v1", Some(api_key.into()))
    }

    /// A local Ollama server; no key needed.
    pub fn ollama(base_url: Option<&str>) -> Result<Self, ProviderError> {
        Self::new("ollama", base_url.unwrap_or("http://localhost:11434/v1"), None)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }
        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }
        body
    }

    async fn send(
        &self,
        request: &ProviderRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.name, model = %request.model, stream, "Sending completion request");

        let mut builder = self.post(&url).json(&Self::request_body(request, stream));
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        let response = builder.send().await.map_err(transport_error)?;
        check_status(response).await
    }

    /// Ask the server's model listing. Many OpenAI-compatible servers
    /// report the window there; OpenAI itself does not.
    async fn listed_context_window(&self, model: &str) -> Result<Option<usize>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let mut builder = self.client.get(&url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = check_status(builder.send().await.map_err(transport_error)?).await?;
        let listing: ModelListing = response
            .json()
            .await
            .map_err(|e| ProviderError::Network(format!("invalid model listing: {e}")))?;
        Ok(listing
            .data
            .into_iter()
            .find(|entry| entry.id == model)
            .and_then(|entry| entry.context_window()))
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self.send(&request, false).await?;
        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;
        api_response.into_provider_response()
    }

    async fn stream(&self, request: ProviderRequest) -> Result<CompletionStream, ProviderError> {
        let response = self.send(&request, true).await?;
        let (tx, cancel, stream) = CompletionStream::channel(STREAM_BUFFER);
        let provider_name = self.name.clone();

        // Read the SSE body until done, error, or the consumer cancels.
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(provider = %provider_name, "Stream cancelled by consumer");
                        return;
                    }
                    next = bytes.next() => next,
                };

                let Some(next) = next else { break };
                let data = match next {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for chunk in decoder.feed(&data) {
                    let done = chunk.done;
                    if tx.send(Ok(chunk)).await.is_err() || done {
                        return;
                    }
                }
            }

            // Body ended without [DONE].
            trace!(provider = %provider_name, "Stream ended without a [DONE] marker");
            let _ = tx.send(Ok(decoder.finish())).await;
        });

        Ok(stream)
    }

    async fn context_window(&self, model: &str) -> Result<Option<usize>, ProviderError> {
        match self.listed_context_window(model).await {
            Ok(Some(window)) => return Ok(Some(window)),
            Ok(None) => {}
            Err(e) => debug!(provider = %self.name, error = %e, "Model listing unavailable"),
        }
        Ok(known_context_window(model))
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();
    match status {
        200..=299 => Ok(response),
        429 => {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5);
            Err(ProviderError::RateLimited { retry_after_secs })
        }
        401 | 403 => Err(ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        )),
        _ => {
            let body = response.text().await.unwrap_or_default();
            warn!(status, body = %body, "Provider returned error");
            Err(ProviderError::ApiError {
                status_code: status,
                message: body,
            })
        }
    }
}

/// Windows of well-known models, for servers that do not report one.
fn known_context_window(model: &str) -> Option<usize> {
    let model = model.rsplit('/').next().unwrap_or(model);
    let window = if model.starts_with("gpt-4.1") {
        1_047_576
    } else if model.starts_with("gpt-4o") || model.starts_with("gpt-4-turbo") {
        128_000
    } else if model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4") {
        200_000
    } else if model.starts_with("gpt-3.5-turbo") {
        16_385
    } else if model.starts_with("gpt-4") {
        8_192
    } else {
        return None;
    };
    Some(window)
}

fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| ApiMessage {
            role: match m.role {
                Role::User => "user".into(),
                Role::Assistant => "assistant".into(),
                Role::System => "system".into(),
                Role::Tool => "tool".into(),
            },
            content: Some(m.content.clone()),
            tool_calls: (!m.tool_calls.is_empty()).then(|| {
                m.tool_calls
                    .iter()
                    .map(|tc| ApiToolCall {
                        id: tc.id.clone(),
                        r#type: "function".into(),
                        function: ApiFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: m.tool_call_id.clone(),
            name: m.name.clone(),
        })
        .collect()
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function".into(),
            function: ApiToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

/// Incremental decoder for the chat-completions SSE body.
///
/// Bytes are buffered until a full line arrives, so multi-byte characters
/// split across network reads survive. Tool-call fragments are accumulated
/// by index and released with the final chunk.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    calls: BTreeMap<u32, ToolCallAccumulator>,
    usage: Option<Usage>,
}

impl SseDecoder {
    fn feed(&mut self, data: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(data);
        let mut chunks = Vec::new();

        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            // Blank separators and SSE comments.
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();

            if payload == "[DONE]" {
                chunks.push(self.finish());
                return chunks;
            }

            match serde_json::from_str::<StreamResponse>(payload) {
                Ok(response) => {
                    if let Some(usage) = response.usage {
                        self.usage = Some(usage.into());
                    }
                    for choice in response.choices {
                        for delta in choice.delta.tool_calls.unwrap_or_default() {
                            let acc = self.calls.entry(delta.index).or_default();
                            if let Some(id) = delta.id {
                                acc.id = id;
                            }
                            if let Some(function) = delta.function {
                                if let Some(name) = function.name {
                                    acc.name = name;
                                }
                                if let Some(arguments) = function.arguments {
                                    acc.arguments.push_str(&arguments);
                                }
                            }
                        }
                        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                            chunks.push(StreamChunk {
                                content: Some(content),
                                ..Default::default()
                            });
                        }
                    }
                }
                Err(e) => {
                    trace!(data = %payload, error = %e, "Ignoring unparseable SSE chunk");
                }
            }
        }
        chunks
    }

    /// The closing chunk: accumulated tool calls and usage.
    fn finish(&mut self) -> StreamChunk {
        StreamChunk {
            content: None,
            tool_calls: std::mem::take(&mut self.calls)
                .into_values()
                .map(ToolCallAccumulator::into_tool_call)
                .collect(),
            done: true,
            usage: self.usage.take(),
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

impl ApiResponse {
    fn into_provider_response(self) -> Result<ProviderResponse, ProviderError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let tool_calls: Vec<MessageToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| MessageToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        Ok(ProviderResponse {
            message: Message::assistant_with_calls(
                choice.message.content.unwrap_or_default(),
                tool_calls,
            ),
            usage: self.usage.map(Usage::from),
            model: self.model,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    /// OpenRouter
    #[serde(default)]
    context_length: Option<usize>,
    /// vLLM
    #[serde(default)]
    max_model_len: Option<usize>,
    #[serde(default)]
    context_window: Option<usize>,
}

impl ModelEntry {
    fn context_window(&self) -> Option<usize> {
        self.context_length
            .or(self.max_model_len)
            .or(self.context_window)
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta: arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> MessageToolCall {
        MessageToolCall {
            id: self.id,
            name: self.name,
            arguments: self.arguments,
        }
    }
}
