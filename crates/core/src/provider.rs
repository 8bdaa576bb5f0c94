//! Provider trait: the abstraction over completion engines.
//!
//! A Provider sends a message list to a model and gets a response back,
//! either complete or as a stream of chunks. Either form may carry natively
//! structured tool calls next to the text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};

/// Configuration for a provider request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tools passed through the engine's native tool field
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message (text plus any native tool calls)
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Completed native tool calls (usually only on the final chunk)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A cancellable stream of completion chunks with a single consumer.
///
/// Cancelling the handle (or dropping it) signals the producer through the
/// shared token; producers stop reading from the transport as soon as they
/// observe it. After cancellation `next()` yields `None`.
pub struct CompletionStream {
    rx: mpsc::Receiver<Result<StreamChunk, ProviderError>>,
    cancel: CancellationToken,
}

impl CompletionStream {
    /// Wrap a chunk channel. The producer must watch `cancel`.
    pub fn new(
        rx: mpsc::Receiver<Result<StreamChunk, ProviderError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { rx, cancel }
    }

    /// Create a producer/consumer pair. The sender side is handed to the task
    /// that talks to the engine, together with a clone of the token.
    pub fn channel(
        capacity: usize,
    ) -> (
        mpsc::Sender<Result<StreamChunk, ProviderError>>,
        CancellationToken,
        Self,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        (tx, cancel.clone(), Self::new(rx, cancel))
    }

    /// A single-chunk stream built from a complete response.
    pub fn from_response(response: ProviderResponse) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let chunk = StreamChunk {
            content: Some(response.message.content),
            tool_calls: response.message.tool_calls,
            done: true,
            usage: response.usage,
        };
        // Capacity 1 and a fresh channel: this cannot fail.
        let _ = tx.try_send(Ok(chunk));
        Self::new(rx, CancellationToken::new())
    }

    /// Receive the next chunk, or `None` once the stream ended or was cancelled.
    pub async fn next(&mut self) -> Option<Result<StreamChunk, ProviderError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Stop the generation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by the producer side.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The core Provider trait.
///
/// Every engine backend implements this trait. The orchestrator calls
/// `complete()` or `stream()` without knowing which backend is in use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Send a request and get a cancellable stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(&self, request: ProviderRequest) -> Result<CompletionStream, ProviderError> {
        let response = self.complete(request).await?;
        Ok(CompletionStream::from_response(response))
    }

    /// The context window of `model` in tokens, if the engine can tell.
    async fn context_window(&self, _model: &str) -> Result<Option<usize>, ProviderError> {
        Ok(None)
    }

    /// Whether tool schemas can go in the request's native tool field.
    fn supports_native_tools(&self) -> bool {
        true
    }
}
