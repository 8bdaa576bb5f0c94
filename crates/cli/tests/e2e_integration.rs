//! End-to-end integration tests for Parley.
//!
//! These tests drive whole turns through `ChatService` with the built-in
//! tools, from user input to the committed history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_agent::{
    CharHeuristic, ChatService, Orchestrator, OrchestratorSettings, TokenCounter, TurnEvent,
    TurnResult,
};
use parley_core::error::{ErrorKind, ProviderError};
use parley_core::message::{Message, MessageToolCall, Role};
use parley_core::provider::{
    CompletionStream, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage,
};
use parley_core::session::SessionId;
use parley_tools::default_registry;
use serde_json::json;
use tempfile::TempDir;

// ── Mock Providers ───────────────────────────────────────────────────────

enum Step {
    Reply(ProviderResponse),
    Fail(ProviderError),
}

/// A mock provider that plays back scripted steps in sequence.
struct ScriptedProvider {
    steps: Vec<Step>,
    repeat_last: bool,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            repeat_last: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn replies(responses: Vec<ProviderResponse>) -> Self {
        Self::new(responses.into_iter().map(Step::Reply).collect())
    }

    fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> ProviderRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        let index = requests.len();
        requests.push(request);

        let index = if self.repeat_last {
            index.min(self.steps.len() - 1)
        } else {
            index
        };
        match self.steps.get(index) {
            Some(Step::Reply(response)) => Ok(response.clone()),
            Some(Step::Fail(error)) => Err(error.clone()),
            None => panic!(
                "ScriptedProvider exhausted: call #{index}, have {}",
                self.steps.len()
            ),
        }
    }
}

/// Streams one chunk, then waits for the consumer to cancel.
struct StallingProvider {
    saw_cancel: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Provider for StallingProvider {
    fn name(&self) -> &str {
        "stalling_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured("streaming only".into()))
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<CompletionStream, ProviderError> {
        let (tx, token, stream) = CompletionStream::channel(4);
        let saw_cancel = self.saw_cancel.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(Ok(StreamChunk {
                    content: Some("Once upon a ti".into()),
                    ..Default::default()
                }))
                .await;
            token.cancelled().await;
            saw_cancel.store(true, Ordering::SeqCst);
        });
        Ok(stream)
    }
}

fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock".into(),
    }
}

fn tool_response(tool_calls: Vec<MessageToolCall>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_calls(thought, tool_calls),
        usage: None,
        model: "mock".into(),
    }
}

fn make_tool_call(id: &str, name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.into(),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

struct Harness {
    chat: ChatService,
    output: TempDir,
}

fn harness_with(provider: Arc<dyn Provider>, settings: OrchestratorSettings, window: usize) -> Harness {
    let output = tempfile::tempdir().unwrap();
    let tools = Arc::new(default_registry(output.path()).unwrap());
    let orchestrator = Orchestrator::new(provider, tools, settings, window);
    Harness {
        chat: ChatService::in_memory(orchestrator),
        output,
    }
}

fn harness(provider: Arc<dyn Provider>) -> Harness {
    harness_with(provider, OrchestratorSettings::default(), 8192)
}

fn roles(history: &[Message]) -> Vec<Role> {
    history.iter().map(|m| m.role).collect()
}

// ── E2E: Tools ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_text_stats_then_answer() {
    let provider = Arc::new(ScriptedProvider::replies(vec![
        tool_response(
            vec![make_tool_call(
                "call_1",
                "text_stats",
                json!({"text": "One sentence. Two sentences!"}),
            )],
            "Let me count.",
        ),
        text_response("There are 4 words in 2 sentences."),
    ]));
    let h = harness(provider.clone());
    let id = SessionId::from("stats");

    let result = h.chat.submit_turn(&id, "How long is my text?").await;
    assert_eq!(result.answer_text(), Some("There are 4 words in 2 sentences."));
    assert_eq!(provider.calls(), 2);

    let history = h.chat.history(&id).await.unwrap();
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    let stats: serde_json::Value = serde_json::from_str(&history[2].content).unwrap();
    assert_eq!(stats["words"], 4);
    assert_eq!(stats["sentences"], 2);
}

#[tokio::test]
async fn e2e_generate_file_stays_in_output_dir() {
    let provider = Arc::new(ScriptedProvider::replies(vec![
        tool_response(
            vec![
                make_tool_call(
                    "call_ok",
                    "generate_file",
                    json!({"file_name": "notes.md", "content": "# Notes\n"}),
                ),
                make_tool_call(
                    "call_bad",
                    "generate_file",
                    json!({"file_name": "../escape.md", "content": "nope"}),
                ),
            ],
            "",
        ),
        text_response("Wrote notes.md; the other name was refused."),
    ]));
    let h = harness(provider);
    let id = SessionId::from("files");

    let result = h.chat.submit_turn(&id, "write two files").await;
    assert!(result.answer_text().is_some());

    assert_eq!(
        std::fs::read_to_string(h.output.path().join("notes.md")).unwrap(),
        "# Notes\n"
    );
    assert!(!h.output.path().parent().unwrap().join("escape.md").exists());

    let history = h.chat.history(&id).await.unwrap();
    assert_eq!(history[2].tool_call_id.as_deref(), Some("call_ok"));
    assert_eq!(history[3].tool_call_id.as_deref(), Some("call_bad"));
    assert!(history[3].content.contains("EXECUTION_FAILED"));
}

#[tokio::test]
async fn e2e_malformed_arguments_are_fed_back() {
    let provider = Arc::new(ScriptedProvider::replies(vec![
        tool_response(
            vec![
                MessageToolCall {
                    id: "call_1".into(),
                    name: "text_stats".into(),
                    arguments: "{\"text\": \"unterminated".into(),
                },
                make_tool_call("call_2", "generate_file", json!({"file_name": "a.txt"})),
            ],
            "",
        ),
        text_response("Let me fix my arguments."),
    ]));
    let h = harness(provider.clone());
    let id = SessionId::from("malformed");

    let result = h.chat.submit_turn(&id, "go").await;
    assert_eq!(result.answer_text(), Some("Let me fix my arguments."));

    let history = h.chat.history(&id).await.unwrap();
    assert!(history[2].content.contains("MALFORMED_ARGUMENTS"));
    assert!(history[3].content.contains("MALFORMED_ARGUMENTS"));
    assert!(history[3].content.contains("content"));
    // The engine saw both errors on its second request.
    let second = provider.request(1);
    assert_eq!(
        second.messages.iter().filter(|m| m.role == Role::Tool).count(),
        2
    );
}

// ── E2E: Pending tools ───────────────────────────────────────────────────

#[tokio::test]
async fn e2e_recording_request_pauses_and_resumes() {
    let provider = Arc::new(ScriptedProvider::replies(vec![
        tool_response(
            vec![make_tool_call(
                "rec_1",
                "request_recording",
                json!({"prompt": "Read the first line aloud", "media": "audio"}),
            )],
            "I need to hear it.",
        ),
        text_response("Your pronunciation is clear."),
    ]));
    let h = harness(provider.clone());
    let id = SessionId::from("recording");

    let result = h.chat.submit_turn(&id, "check my pronunciation").await;
    let TurnResult::PendingTool { tool_call, request } = result else {
        panic!("expected a pending tool, got {result:?}");
    };
    assert_eq!(tool_call.id, "rec_1");
    assert_eq!(request["prompt"], "Read the first line aloud");
    assert_eq!(provider.calls(), 1);

    let pending = h.chat.pending_tool(&id).await.unwrap().unwrap();
    assert_eq!(pending.call.name, "request_recording");

    let result = h
        .chat
        .resume_turn(&id, "rec_1", json!({"file": "line1.wav", "seconds": 4}))
        .await;
    assert_eq!(result.answer_text(), Some("Your pronunciation is clear."));
    assert!(h.chat.pending_tool(&id).await.unwrap().is_none());

    let history = h.chat.history(&id).await.unwrap();
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert!(history[2].content.contains("line1.wav"));
}

#[tokio::test]
async fn e2e_resuming_an_unknown_call_is_rejected() {
    let provider = Arc::new(ScriptedProvider::replies(vec![tool_response(
        vec![make_tool_call(
            "rec_1",
            "request_recording",
            json!({"prompt": "Hum a tune"}),
        )],
        "",
    )]));
    let h = harness(provider);
    let id = SessionId::from("wrong-resume");

    h.chat.submit_turn(&id, "listen to me").await;
    let result = h.chat.resume_turn(&id, "rec_999", json!("tune.wav")).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::InvalidResumption));
    // Still waiting on the real call.
    assert!(h.chat.pending_tool(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn e2e_new_input_supersedes_pending_recording() {
    let provider = Arc::new(ScriptedProvider::replies(vec![
        tool_response(
            vec![make_tool_call(
                "rec_1",
                "request_recording",
                json!({"prompt": "Say something"}),
            )],
            "",
        ),
        text_response("No problem, let's skip it."),
    ]));
    let h = harness(provider);
    let id = SessionId::from("supersede");

    h.chat.submit_turn(&id, "record me").await;
    let result = h.chat.submit_turn(&id, "never mind").await;
    assert_eq!(result.answer_text(), Some("No problem, let's skip it."));
    assert!(h.chat.pending_tool(&id).await.unwrap().is_none());

    let history = h.chat.history(&id).await.unwrap();
    assert_eq!(
        roles(&history),
        vec![
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::User,
            Role::Assistant
        ]
    );
    assert_eq!(history[2].tool_call_id.as_deref(), Some("rec_1"));
    assert!(history[2].content.contains("superseded"));
}

// ── E2E: Guards ──────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_repeated_tool_calls_stop_on_the_fifth() {
    let provider = Arc::new(
        ScriptedProvider::replies(vec![tool_response(
            vec![make_tool_call(
                "call",
                "text_stats",
                json!({"text": "same text every time"}),
            )],
            "Counting again.",
        )])
        .repeating(),
    );
    let h = harness(provider.clone());
    let id = SessionId::from("loop");

    let result = h.chat.submit_turn(&id, "count forever").await;
    let TurnResult::Error { detail } = result else {
        panic!("expected a loop error, got {result:?}");
    };
    assert_eq!(detail.kind, ErrorKind::LoopDetected);
    assert_eq!(detail.partial_answer.as_deref(), Some("Counting again."));
    assert_eq!(provider.calls(), 5);

    let history = h.chat.history(&id).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.content.contains("[LOOP_DETECTED]"));
}

#[tokio::test]
async fn e2e_iteration_cap() {
    let provider = Arc::new(ScriptedProvider::replies(vec![
        tool_response(
            vec![make_tool_call("c1", "text_stats", json!({"text": "one"}))],
            "",
        ),
        tool_response(
            vec![make_tool_call("c2", "text_stats", json!({"text": "two"}))],
            "",
        ),
        tool_response(
            vec![make_tool_call("c3", "text_stats", json!({"text": "three"}))],
            "",
        ),
    ]));
    let settings = OrchestratorSettings {
        max_iterations: 3,
        ..Default::default()
    };
    let h = harness_with(provider.clone(), settings, 8192);

    let result = h.chat.submit_turn(&SessionId::from("cap"), "keep going").await;
    assert_eq!(result.error_kind(), Some(ErrorKind::IterationCapExceeded));
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn e2e_small_window_truncates_history_and_rejects_huge_input() {
    let provider = Arc::new(ScriptedProvider::replies(vec![text_response("ok")]).repeating());
    let h = harness_with(provider.clone(), OrchestratorSettings::default(), 2048);
    let id = SessionId::from("window");

    for i in 0..15 {
        let text = format!("question {i}: {}", "padding ".repeat(60));
        let result = h.chat.submit_turn(&id, text).await;
        assert_eq!(result.answer_text(), Some("ok"));
    }
    let history = h.chat.history(&id).await.unwrap();
    assert_eq!(history.len(), 30);

    // The last request fit the window minus the response reserve.
    let last = provider.request(provider.calls() - 1);
    let counter = CharHeuristic::default();
    let sent = counter.count_messages(&last.messages) + counter.count_tools(&last.tools);
    assert!(sent <= 2048 - 205, "sent {sent} tokens");
    assert!(last.messages.len() < history.len());
    assert!(last.messages.last().unwrap().content.starts_with("question 14"));

    let calls_before = provider.calls();
    let result = h.chat.submit_turn(&id, "huge ".repeat(4000)).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ContextOverflow));
    assert_eq!(provider.calls(), calls_before);
    assert_eq!(h.chat.history(&id).await.unwrap().len(), 30);
}

#[tokio::test]
async fn e2e_transient_engine_failure_is_retried() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Step::Fail(ProviderError::RateLimited {
            retry_after_secs: 1,
        }),
        Step::Reply(text_response("Back online.")),
    ]));
    let h = harness(provider.clone());

    let result = h.chat.submit_turn(&SessionId::from("retry"), "hello").await;
    assert_eq!(result.answer_text(), Some("Back online."));
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn e2e_persistent_engine_failure_keeps_history() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Step::Reply(text_response("First answer.")),
        Step::Fail(ProviderError::Network("connection refused".into())),
        Step::Fail(ProviderError::Network("connection refused".into())),
    ]));
    let h = harness(provider.clone());
    let id = SessionId::from("down");

    h.chat.submit_turn(&id, "first").await;
    let result = h.chat.submit_turn(&id, "second").await;
    assert_eq!(result.error_kind(), Some(ErrorKind::EngineFailure));
    assert_eq!(provider.calls(), 3);
    // The failed turn's user message is not stored.
    assert_eq!(h.chat.history(&id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn e2e_gibberish_is_retried_once() {
    let provider = Arc::new(ScriptedProvider::replies(vec![
        text_response(&"?".repeat(400)),
        text_response("A real answer."),
    ]));
    let h = harness(provider.clone());
    let id = SessionId::from("gibberish");

    let result = h.chat.submit_turn(&id, "hi").await;
    assert_eq!(result.answer_text(), Some("A real answer."));
    assert_eq!(provider.calls(), 2);
    let history = h.chat.history(&id).await.unwrap();
    assert!(history.iter().all(|m| !m.content.contains("???")));
}

// ── E2E: Streaming and cancellation ──────────────────────────────────────

#[tokio::test]
async fn e2e_cancel_mid_stream_and_busy_session() {
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let provider = Arc::new(StallingProvider {
        saw_cancel: saw_cancel.clone(),
    });
    let settings = OrchestratorSettings {
        stream: true,
        ..Default::default()
    };
    let h = harness_with(provider, settings, 8192);
    let id = SessionId::from("story");

    let mut handle = h.chat.submit_turn_stream(&id, "tell me a story");
    match handle.next_event().await {
        Some(TurnEvent::TextDelta { content }) => assert_eq!(content, "Once upon a ti"),
        other => panic!("expected a text delta, got {other:?}"),
    }

    let second = h.chat.submit_turn(&id, "are you there?").await;
    assert_eq!(second.error_kind(), Some(ErrorKind::SessionBusy));

    handle.cancel();
    assert_eq!(handle.finish().await.error_kind(), Some(ErrorKind::Cancelled));
    assert!(h.chat.history(&id).await.unwrap().is_empty());

    for _ in 0..100 {
        if saw_cancel.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_cancel.load(Ordering::SeqCst));
}

#[tokio::test]
async fn e2e_streamed_tool_turn_reports_events_in_order() {
    let provider = Arc::new(ScriptedProvider::replies(vec![
        tool_response(
            vec![make_tool_call("call_1", "text_stats", json!({"text": "hi there"}))],
            "",
        ),
        text_response("Two words."),
    ]));
    let settings = OrchestratorSettings {
        stream: true,
        ..Default::default()
    };
    let h = harness_with(provider, settings, 8192);

    let mut handle = h.chat.submit_turn_stream(&SessionId::from("events"), "count");
    let mut kinds = Vec::new();
    while let Some(event) = handle.next_event().await {
        kinds.push(event.event_type());
        if let TurnEvent::Done { result } = event {
            assert_eq!(result.answer_text(), Some("Two words."));
            break;
        }
    }
    assert_eq!(
        kinds,
        vec!["tool_call", "tool_result", "text_delta", "done"]
    );
}
