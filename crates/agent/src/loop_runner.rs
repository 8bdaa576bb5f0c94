//! The orchestration loop.
//!
//! One call to [`Orchestrator::run_turn`] drives a turn through
//! prepare → generate → parse → execute tools, looping until the model
//! answers, a terminal-for-turn tool hands control back to the caller, or
//! the turn fails. The session goes in by value and comes back out: on
//! success (and on a deliberate halt) the updated copy is returned, on any
//! other failure the session exactly as it was before the turn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parley_config::AppConfig;
use parley_core::error::{ErrorKind, ProviderError};
use parley_core::event::{DomainEvent, EventBus};
use parley_core::message::{Message, MessageToolCall};
use parley_core::provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
use parley_core::session::Session;
use parley_core::tool::{ToolCall, ToolRegistry, ToolResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{
    BudgetPolicy, CharHeuristic, MessagePreparer, PrepareMode, TokenBudget, TokenCounter,
};
use crate::executor::{ExecutionOutcome, ToolExecutor};
use crate::injector::ToolInjector;
use crate::parser::{ParsedCalls, ParsedOutput, ToolCallParser};
use crate::stream_event::{DeltaGate, TurnEvent};
use crate::turn::{TurnError, TurnInput, TurnResult};
use crate::validator::{CallSignature, LoopPolicy, OutputPolicy, ResponseValidator};

/// Used when neither configuration nor the engine knows the window.
pub const DEFAULT_CONTEXT_WINDOW: usize = 8192;

/// Tunables for the loop.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model: String,
    pub temperature: f32,
    /// Upper bound on response tokens; the budget may lower it further.
    pub max_tokens: Option<u32>,
    /// Prepended to every request, never stored in the session.
    pub system_prompt: String,
    /// Hard cap on generations per turn.
    pub max_iterations: u32,
    pub stream: bool,
    /// Use the engine's native tool field when it has one.
    pub native_tools: bool,
    pub engine_timeout: Duration,
    pub budget: BudgetPolicy,
    pub aggressive_tool_result_chars: usize,
    pub loops: LoopPolicy,
    pub output: OutputPolicy,
    pub tool_timeout: Duration,
    pub chars_per_token: usize,
    pub message_overhead_tokens: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: None,
            system_prompt: "You are a helpful assistant.".into(),
            max_iterations: 10,
            stream: false,
            native_tools: true,
            engine_timeout: Duration::from_secs(120),
            budget: BudgetPolicy::default(),
            aggressive_tool_result_chars: 2000,
            loops: LoopPolicy::default(),
            output: OutputPolicy::default(),
            tool_timeout: Duration::from_secs(30),
            chars_per_token: 4,
            message_overhead_tokens: 4,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.engine.model.clone(),
            temperature: config.engine.temperature,
            max_tokens: config.engine.max_tokens,
            system_prompt: config.agent.system_prompt.clone(),
            max_iterations: config.agent.max_iterations,
            stream: config.agent.stream,
            native_tools: config.engine.native_tools,
            engine_timeout: Duration::from_secs(config.engine.request_timeout_secs),
            budget: BudgetPolicy::new(config.budget.reserve_fraction, config.budget.floor_tokens),
            aggressive_tool_result_chars: config.budget.aggressive_tool_result_chars,
            loops: LoopPolicy {
                max_consecutive: config.loop_guard.max_consecutive_tool_calls,
                pattern_threshold: config.loop_guard.repetitive_pattern_threshold,
                window: config.loop_guard.recent_tool_calls_window,
            },
            output: OutputPolicy {
                max_output_chars: config.output_guard.max_output_chars,
                char_run_threshold: config.output_guard.char_run_threshold,
                dominant_char_ratio: config.output_guard.dominant_char_ratio,
                phrase_repeat_threshold: config.output_guard.phrase_repeat_threshold,
                phrase_words: config.output_guard.phrase_words,
            },
            tool_timeout: Duration::from_secs(config.tools.timeout_secs),
            chars_per_token: config.budget.chars_per_token,
            message_overhead_tokens: config.budget.message_overhead_tokens,
        }
    }
}

/// Drives turns against one engine and one tool catalog.
pub struct Orchestrator {
    /// The completion engine
    provider: Arc<dyn Provider>,

    /// Read-only after construction, shared by every session
    tools: Arc<ToolRegistry>,

    executor: ToolExecutor,

    counter: Arc<dyn TokenCounter>,

    preparer: MessagePreparer,

    injector: ToolInjector,

    parser: ToolCallParser,

    validator: ResponseValidator,

    settings: OrchestratorSettings,

    /// Engine context window in tokens
    context_window: usize,

    event_bus: Arc<EventBus>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        settings: OrchestratorSettings,
        context_window: usize,
    ) -> Self {
        let counter: Arc<dyn TokenCounter> = Arc::new(CharHeuristic::new(
            settings.chars_per_token,
            settings.message_overhead_tokens,
        ));
        let injector = ToolInjector::for_engine(provider.supports_native_tools(), settings.native_tools);
        Self {
            executor: ToolExecutor::new(tools.clone(), settings.tool_timeout),
            preparer: MessagePreparer::new(counter.clone(), settings.aggressive_tool_result_chars)
                .with_injection_mode(injector.mode()),
            validator: ResponseValidator::new(counter.clone(), settings.output, settings.loops),
            parser: ToolCallParser::new(),
            injector,
            counter,
            provider,
            tools,
            settings,
            context_window,
            event_bus: Arc::new(EventBus::default()),
        }
    }

    /// Build an orchestrator, asking the engine for its context window.
    ///
    /// A `configured` window wins over what the engine reports.
    pub async fn connect(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        settings: OrchestratorSettings,
        configured: Option<usize>,
    ) -> Self {
        let context_window = match configured {
            Some(window) => window,
            None => match provider.context_window(&settings.model).await {
                Ok(Some(window)) => window,
                Ok(None) => {
                    debug!(
                        provider = provider.name(),
                        default = DEFAULT_CONTEXT_WINDOW,
                        "Engine did not report a context window"
                    );
                    DEFAULT_CONTEXT_WINDOW
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Context window lookup failed");
                    DEFAULT_CONTEXT_WINDOW
                }
            },
        };
        info!(
            provider = provider.name(),
            model = %settings.model,
            context_window,
            "Orchestrator ready"
        );
        Self::new(provider, tools, settings, context_window)
    }

    /// Publish domain events on a shared bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Replace the character heuristic with another token counter.
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.preparer =
            MessagePreparer::new(counter.clone(), self.settings.aggressive_tool_result_chars)
                .with_injection_mode(self.injector.mode());
        self.validator =
            ResponseValidator::new(counter.clone(), self.settings.output, self.settings.loops);
        self.counter = counter;
        self
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run one turn. Never fails outright: errors come back as
    /// [`TurnResult::Error`] together with the session to keep.
    pub async fn run_turn(
        &self,
        session: Session,
        input: TurnInput,
        events: Option<&mpsc::Sender<TurnEvent>>,
        cancel: &CancellationToken,
    ) -> (Session, TurnResult) {
        let resumed = matches!(input, TurnInput::Resume { .. });
        info!(session_id = %session.id, resumed, "Turn started");
        self.event_bus.publish(DomainEvent::TurnStarted {
            session_id: session.id.to_string(),
            resumed,
            timestamp: Utc::now(),
        });

        let mut state = TurnState {
            session: session.clone(),
            iterations: 0,
            partial: String::new(),
            signatures: Vec::new(),
            events,
            cancel,
        };
        let outcome = self.drive(&mut state, input).await;
        let iterations = state.iterations;

        let (session, result) = match outcome {
            Ok(result) => (state.session, result),
            Err(detail) if detail.kind.is_deliberate_halt() => {
                (state.session, TurnResult::Error { detail })
            }
            Err(detail) => (session, TurnResult::Error { detail }),
        };

        match &result {
            TurnResult::Error { detail } => {
                warn!(session_id = %session.id, iterations, kind = %detail.kind, "Turn failed: {}", detail.message)
            }
            TurnResult::PendingTool { tool_call, .. } => {
                info!(session_id = %session.id, iterations, tool = %tool_call.name, "Turn waiting on tool")
            }
            TurnResult::Answer { .. } => info!(session_id = %session.id, iterations, "Turn answered"),
        }
        self.event_bus.publish(DomainEvent::TurnFinished {
            session_id: session.id.to_string(),
            iterations,
            error: result.error_kind(),
            timestamp: Utc::now(),
        });
        (session, result)
    }

    async fn drive(
        &self,
        state: &mut TurnState<'_>,
        input: TurnInput,
    ) -> Result<TurnResult, TurnError> {
        match input {
            TurnInput::UserText(text) => {
                supersede_unresolved(&mut state.session);
                state.session.push(Message::user(text));
            }
            TurnInput::Resume {
                tool_call_id,
                payload,
            } => {
                let pending = state
                    .session
                    .pending_tool
                    .take()
                    .filter(|p| p.call.id == tool_call_id)
                    .ok_or_else(|| {
                        TurnError::new(
                            ErrorKind::InvalidResumption,
                            format!("session is not waiting on tool call '{tool_call_id}'"),
                        )
                    })?;

                let call = ToolCall::from_wire(&pending.call);
                let result = ToolResult::success(&call, payload);
                state.emit(result_event(&result)).await;
                state.session.push(result.to_message());

                let siblings: Vec<ToolCall> = state
                    .session
                    .unresolved_tool_calls()
                    .iter()
                    .map(ToolCall::from_wire)
                    .collect();
                if !siblings.is_empty() {
                    debug!(count = siblings.len(), "Executing calls left over from before the pause");
                    if let Some(result) = self.execute_calls(state, siblings).await? {
                        return Ok(result);
                    }
                }
            }
        }
        self.iterate(state).await
    }

    async fn iterate(&self, state: &mut TurnState<'_>) -> Result<TurnResult, TurnError> {
        loop {
            if state.cancel.is_cancelled() {
                return Err(cancelled());
            }
            if state.iterations >= self.settings.max_iterations {
                let message = format!(
                    "stopped after {} iterations without a final answer",
                    state.iterations
                );
                return Err(state.halt(ErrorKind::IterationCapExceeded, message));
            }
            state.iterations += 1;
            debug!(session_id = %state.session.id, iteration = state.iterations, "Loop iteration");

            let parsed = self.generate_validated(state).await?;
            let text = parsed.cleaned_text;
            if let ParsedCalls::None = parsed.calls {
                state.session.push(Message::assistant(&text));
                return Ok(TurnResult::Answer { text });
            }

            debug!(
                strategy = parsed.calls.strategy(),
                count = parsed.calls.calls().len(),
                "Model requested tools"
            );
            let calls = parsed.calls.into_calls();
            let wire: Vec<MessageToolCall> = calls.iter().map(ToolCall::to_wire).collect();
            state.session.push(Message::assistant_with_calls(&text, wire));
            if !text.trim().is_empty() {
                state.partial = text.trim().to_string();
            }

            if let Some(result) = self.execute_calls(state, calls).await? {
                return Ok(result);
            }
        }
    }

    /// Execute calls in order. Returns `Some` when a terminal-for-turn tool
    /// hands control back to the caller.
    async fn execute_calls(
        &self,
        state: &mut TurnState<'_>,
        calls: Vec<ToolCall>,
    ) -> Result<Option<TurnResult>, TurnError> {
        let mut remaining = calls.into_iter();
        while let Some(call) = remaining.next() {
            state
                .emit(TurnEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.canonical(),
                })
                .await;

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return Err(cancelled()),
                outcome = self.executor.execute(&call) => outcome,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let success = match &outcome {
                ExecutionOutcome::Completed(result) => result.is_success(),
                ExecutionOutcome::Deferred(_) => true,
            };
            self.event_bus.publish(DomainEvent::ToolExecuted {
                session_id: state.session.id.to_string(),
                tool_name: call.name.clone(),
                success,
                duration_ms,
                timestamp: Utc::now(),
            });

            match outcome {
                ExecutionOutcome::Deferred(pending) => {
                    info!(tool = %call.name, call_id = %call.id, "Handing control to the caller");
                    state.session.pending_tool = Some(pending.clone());
                    return Ok(Some(TurnResult::PendingTool {
                        tool_call: pending.call,
                        request: pending.request,
                    }));
                }
                ExecutionOutcome::Completed(result) => {
                    state.emit(result_event(&result)).await;
                    state.session.push(result.to_message());
                }
            }

            state.signatures.push(CallSignature::from(&call));
            if let Err(violation) = self.validator.validate_call_sequence(&state.signatures) {
                warn!(tool = %call.name, "Tool loop detected: {violation}");
                for skipped in remaining {
                    let result = ToolResult::error(
                        &skipped,
                        ErrorKind::ExecutionFailed,
                        "skipped: the turn stopped on a tool loop",
                        None,
                    );
                    state.session.push(result.to_message());
                }
                return Err(state.halt(violation.kind(), violation.to_string()));
            }
        }
        Ok(None)
    }

    /// Generate, parse and check one model output, with the retries each
    /// failure class allows.
    async fn generate_validated(
        &self,
        state: &mut TurnState<'_>,
    ) -> Result<ParsedOutput, TurnError> {
        let mut request = self.prepare_request(&state.session.messages, PrepareMode::Normal)?;
        let mut engine_retried = false;
        let mut output_retried = false;

        loop {
            let generation = match self.generate(state, request.clone()).await {
                Ok(generation) => generation,
                Err(_) if state.cancel.is_cancelled() => return Err(cancelled()),
                Err(ProviderError::Cancelled) => return Err(cancelled()),
                Err(e) if e.is_transient() && !engine_retried => {
                    engine_retried = true;
                    warn!(error = %e, "Engine call failed, retrying once with a re-truncated request");
                    state
                        .emit(TurnEvent::Discarded {
                            reason: format!("engine failure: {e}"),
                        })
                        .await;
                    request =
                        self.prepare_request(&state.session.messages, PrepareMode::Aggressive)?;
                    continue;
                }
                Err(e) => return Err(TurnError::new(ErrorKind::EngineFailure, e.to_string())),
            };

            let parsed = self.parser.parse(&generation.text, &generation.tool_calls);
            if let Err(violation) = self.validator.validate_output(&parsed.cleaned_text) {
                if output_retried {
                    return Err(TurnError::new(violation.kind(), violation.to_string()));
                }
                output_retried = true;
                warn!("Discarding degenerate output, retrying once: {violation}");
                state
                    .emit(TurnEvent::Discarded {
                        reason: violation.to_string(),
                    })
                    .await;
                continue;
            }

            self.event_bus.publish(DomainEvent::GenerationCompleted {
                session_id: state.session.id.to_string(),
                iteration: state.iterations,
                model: generation.model,
                tokens_used: generation.usage.map(|u| u.total_tokens),
                timestamp: Utc::now(),
            });
            return Ok(parsed);
        }
    }

    /// Build the request, re-truncating aggressively once on overflow.
    fn prepare_request(
        &self,
        history: &[Message],
        mode: PrepareMode,
    ) -> Result<ProviderRequest, TurnError> {
        match self.build_request(history, mode) {
            Err(e) if e.kind == ErrorKind::ContextOverflow && mode == PrepareMode::Normal => {
                warn!("Context overflow, retrying with aggressive truncation: {}", e.message);
                self.build_request(history, PrepareMode::Aggressive)
            }
            other => other,
        }
    }

    fn build_request(
        &self,
        history: &[Message],
        mode: PrepareMode,
    ) -> Result<ProviderRequest, TurnError> {
        let system = (!self.settings.system_prompt.is_empty())
            .then(|| Message::system(&self.settings.system_prompt));
        let system_tokens = system
            .as_ref()
            .map_or(0, |m| self.counter.count_message(m));

        let (budget, tools) = self.budget_with_tools(system_tokens)?;
        let prepared = self
            .preparer
            .prepare(history, &budget, mode)
            .map_err(|e| TurnError::new(ErrorKind::ContextOverflow, e.to_string()))?;

        let mut messages = Vec::with_capacity(prepared.messages.len() + 1);
        messages.extend(system);
        messages.extend(prepared.messages);

        let response_cap = u32::try_from(budget.available_for_response).unwrap_or(u32::MAX);
        let max_tokens = Some(
            self.settings
                .max_tokens
                .map_or(response_cap, |configured| configured.min(response_cap)),
        );

        let request = self.injector.inject(
            ProviderRequest {
                model: self.settings.model.clone(),
                messages,
                temperature: self.settings.temperature,
                max_tokens,
                tools: Vec::new(),
                stream: self.settings.stream,
                stop: Vec::new(),
            },
            &tools,
        );

        self.validator
            .validate(&request, self.context_window)
            .map_err(|v| TurnError::new(v.kind(), v.to_string()))?;
        Ok(request)
    }

    /// Budget with every schema injected, or with optional schemas shed if
    /// that is what it takes to fit.
    fn budget_with_tools(
        &self,
        system_tokens: usize,
    ) -> Result<(TokenBudget, Vec<ToolDefinition>), TurnError> {
        let overflow = |e: crate::context::BudgetError| {
            TurnError::new(ErrorKind::ContextOverflow, e.to_string())
        };

        let all = self.tools.definitions();
        let overhead = system_tokens + self.injector.overhead(&all, self.counter.as_ref());
        match self.settings.budget.compute(self.context_window, overhead) {
            Ok(budget) => Ok((budget, all)),
            Err(e) if self.tools.has_optional() => {
                let essential = self.tools.essential_definitions();
                debug!(
                    kept = essential.len(),
                    total = all.len(),
                    "Shedding optional tool schemas: {e}"
                );
                let overhead =
                    system_tokens + self.injector.overhead(&essential, self.counter.as_ref());
                self.settings
                    .budget
                    .compute(self.context_window, overhead)
                    .map(|budget| (budget, essential))
                    .map_err(overflow)
            }
            Err(e) => Err(overflow(e)),
        }
    }

    /// One engine call under the engine timeout.
    async fn generate(
        &self,
        state: &TurnState<'_>,
        request: ProviderRequest,
    ) -> Result<Generation, ProviderError> {
        let call = async {
            if request.stream {
                self.generate_streaming(state, request).await
            } else {
                let response = tokio::select! {
                    biased;
                    _ = state.cancel.cancelled() => return Err(ProviderError::Cancelled),
                    response = self.provider.complete(request) => response?,
                };
                let generation = Generation::from(response);
                let mut gate = DeltaGate::new();
                for visible in gate.push(&generation.text).into_iter().chain(gate.finish()) {
                    state.emit(TurnEvent::TextDelta { content: visible }).await;
                }
                Ok(generation)
            }
        };

        match tokio::time::timeout(self.settings.engine_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "no response within {}s",
                self.settings.engine_timeout.as_secs_f64()
            ))),
        }
    }

    async fn generate_streaming(
        &self,
        state: &TurnState<'_>,
        request: ProviderRequest,
    ) -> Result<Generation, ProviderError> {
        let mut stream = self.provider.stream(request).await?;
        let mut gate = DeltaGate::new();
        let mut generation = Generation {
            text: String::new(),
            tool_calls: Vec::new(),
            usage: None,
            model: self.settings.model.clone(),
        };

        loop {
            let chunk = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => {
                    stream.cancel();
                    return Err(ProviderError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            if let Some(delta) = chunk.content.filter(|c| !c.is_empty()) {
                if let Some(visible) = gate.push(&delta) {
                    state.emit(TurnEvent::TextDelta { content: visible }).await;
                }
                generation.text.push_str(&delta);
            }
            generation.tool_calls.extend(chunk.tool_calls);
            if chunk.usage.is_some() {
                generation.usage = chunk.usage;
            }
            if chunk.done {
                break;
            }
        }

        if let Some(visible) = gate.finish() {
            state.emit(TurnEvent::TextDelta { content: visible }).await;
        }
        Ok(generation)
    }
}

/// Per-turn working state.
struct TurnState<'a> {
    /// Working copy of the session
    session: Session,
    iterations: u32,
    /// Latest prose the model produced alongside tool calls
    partial: String,
    /// Calls executed this turn, oldest first
    signatures: Vec<CallSignature>,
    events: Option<&'a mpsc::Sender<TurnEvent>>,
    cancel: &'a CancellationToken,
}

impl TurnState<'_> {
    async fn emit(&self, event: TurnEvent) {
        if let Some(events) = self.events {
            // A receiver that went away only loses the live view.
            let _ = events.send(event).await;
        }
    }

    /// Stop on purpose: record a diagnostic note and keep the partial answer.
    fn halt(&mut self, kind: ErrorKind, message: String) -> TurnError {
        let partial_answer = (!self.partial.is_empty()).then(|| self.partial.clone());
        let note = match &partial_answer {
            Some(partial) => format!("{partial}\n\n[{kind}] {message}"),
            None => format!("[{kind}] {message}"),
        };
        self.session.push(Message::assistant(note));
        TurnError {
            kind,
            message,
            partial_answer,
        }
    }
}

/// Raw engine output before parsing.
struct Generation {
    text: String,
    tool_calls: Vec<MessageToolCall>,
    usage: Option<Usage>,
    model: String,
}

impl From<ProviderResponse> for Generation {
    fn from(response: ProviderResponse) -> Self {
        Self {
            text: response.message.content,
            tool_calls: response.message.tool_calls,
            usage: response.usage,
            model: response.model,
        }
    }
}

fn cancelled() -> TurnError {
    TurnError::new(ErrorKind::Cancelled, "turn cancelled by the caller")
}

fn result_event(result: &ToolResult) -> TurnEvent {
    TurnEvent::ToolResult {
        id: result.tool_call_id.clone(),
        name: result.tool_name.clone(),
        success: result.is_success(),
        output: result.render(),
    }
}

/// Pair every open call with a failure before new user input lands.
fn supersede_unresolved(session: &mut Session) {
    session.pending_tool = None;
    for open in session.unresolved_tool_calls() {
        debug!(tool = %open.name, call_id = %open.id, "Superseding unresolved tool call");
        let call = ToolCall::from_wire(&open);
        let result = ToolResult::error(
            &call,
            ErrorKind::ExecutionFailed,
            "superseded by new user input",
            None,
        );
        session.push(result.to_message());
    }
}
