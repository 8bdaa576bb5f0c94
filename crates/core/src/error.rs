//! Error types for the Parley domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`ErrorKind`] is the
//! serialisable taxonomy that tool results and turn outcomes carry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Parley operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Session store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Concurrency ---
    #[error("A turn is already in flight for session {0}")]
    SessionBusy(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of everything that can go wrong inside a turn.
///
/// The first three kinds are recovered locally: they become a `ToolResult`
/// fed back to the model. The rest end the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    MalformedArguments,
    UnknownTool,
    ExecutionFailed,
    ContextOverflow,
    LoopDetected,
    GibberishOutput,
    EngineFailure,
    IterationCapExceeded,
    /// The caller cancelled the turn.
    Cancelled,
    /// A turn is already in flight for the session.
    SessionBusy,
    /// `resume_turn` named a tool call the session is not waiting on.
    InvalidResumption,
    /// The session store could not load or persist the turn.
    StorageFailure,
}

impl ErrorKind {
    /// Stable wire code, e.g. `"LOOP_DETECTED"`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedArguments => "MALFORMED_ARGUMENTS",
            Self::UnknownTool => "UNKNOWN_TOOL",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ContextOverflow => "CONTEXT_OVERFLOW",
            Self::LoopDetected => "LOOP_DETECTED",
            Self::GibberishOutput => "GIBBERISH_OUTPUT",
            Self::EngineFailure => "ENGINE_FAILURE",
            Self::IterationCapExceeded => "ITERATION_CAP_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::SessionBusy => "SESSION_BUSY",
            Self::InvalidResumption => "INVALID_RESUMPTION",
            Self::StorageFailure => "STORAGE_FAILURE",
        }
    }

    /// Whether the loop stopped on purpose and may carry a partial answer.
    pub fn is_deliberate_halt(&self) -> bool {
        matches!(self, Self::LoopDetected | Self::IterationCapExceeded)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Generation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Failures worth one more attempt (transport-level or timeout).
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailed(_) | Self::NotConfigured(_) | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool already registered: {0}")]
    DuplicateName(String),

    #[error("Invalid tool definition for '{tool_name}': {reason}")]
    InvalidDefinition { tool_name: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}
