//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley runtime.
//! This crate has **no framework dependencies**: it defines the domain model
//! that the engine adapters, tools, and the orchestrator implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`Provider`] is the completion engine (blocking or streaming)
//! - [`Tool`] is a named capability with a schema and a call contract
//! - [`SessionStore`] owns per-session message history
//!
//! Implementations live in their respective crates, so tests can swap in
//! scripted providers and in-memory stores.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ErrorKind, ProviderError, Result, StoreError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{
    CompletionStream, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition,
    Usage,
};
pub use session::{PendingTool, Session, SessionId, SessionStore};
pub use tool::{Tool, ToolArguments, ToolCall, ToolOutcome, ToolRegistry, ToolResult};
