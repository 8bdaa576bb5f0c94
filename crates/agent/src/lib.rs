//! The orchestration loop: the heart of Parley.
//!
//! A turn follows a **Prepare → Generate → Parse → Execute** cycle:
//!
//! 1. **Prepare** the request: budget the context window, truncate history
//!    oldest-first, inject tool schemas
//! 2. **Generate** with the configured engine (blocking or streaming)
//! 3. **Parse** tool calls, native or embedded in the text, and check the
//!    output for degenerate generations
//! 4. **Execute** the calls, append their results, loop back to step 1
//!
//! The loop ends when the model answers without calling tools, a
//! terminal-for-turn tool hands control to the caller, or a guard (loop
//! detection, iteration cap, overflow, engine failure) stops it.

pub mod context;
pub mod executor;
pub mod injector;
pub mod loop_runner;
pub mod parser;
pub mod service;
pub mod store;
pub mod stream_event;
pub mod turn;
pub mod validator;

#[cfg(test)]
mod test_helpers;

pub use context::{
    BudgetError, BudgetPolicy, CharHeuristic, MessagePreparer, OverflowError, PrepareMode,
    Prepared, TokenBudget, TokenCounter,
};
pub use executor::{ExecutionOutcome, ToolExecutor};
pub use injector::{InjectionMode, ToolInjector};
pub use loop_runner::{Orchestrator, OrchestratorSettings, DEFAULT_CONTEXT_WINDOW};
pub use parser::{ParsedCalls, ParsedOutput, ToolCallParser};
pub use service::{ChatService, TurnHandle};
pub use store::InMemorySessionStore;
pub use stream_event::{DeltaGate, TurnEvent};
pub use turn::{TurnError, TurnInput, TurnResult};
pub use validator::{CallSignature, LoopPolicy, OutputPolicy, ResponseValidator, Violation};
