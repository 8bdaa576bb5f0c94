//! The caller-facing API: turns by session id.
//!
//! `ChatService` loads the session, runs the orchestrator, and commits what
//! the turn produced. It also enforces one in-flight turn per session:
//! a second turn for a busy session is rejected with `SESSION_BUSY`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use parley_core::error::{Error, ErrorKind, StoreError};
use parley_core::message::Message;
use parley_core::session::{PendingTool, Session, SessionId, SessionStore};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error};

use crate::loop_runner::Orchestrator;
use crate::store::InMemorySessionStore;
use crate::stream_event::TurnEvent;
use crate::turn::{TurnError, TurnInput, TurnResult};

const EVENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn SessionStore>,
    orchestrator: Arc<Orchestrator>,
    in_flight: Arc<Mutex<HashSet<SessionId>>>,
}

impl ChatService {
    pub fn new(store: Arc<dyn SessionStore>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// A service backed by [`InMemorySessionStore`].
    pub fn in_memory(orchestrator: Orchestrator) -> Self {
        Self::new(Arc::new(InMemorySessionStore::new()), Arc::new(orchestrator))
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run a turn to completion.
    pub async fn submit_turn(&self, session_id: &SessionId, text: impl Into<String>) -> TurnResult {
        self.submit_turn_with_cancel(session_id, text, &CancellationToken::new())
            .await
    }

    /// Run a turn that `cancel` can abort.
    pub async fn submit_turn_with_cancel(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
        cancel: &CancellationToken,
    ) -> TurnResult {
        match self.acquire(session_id) {
            Ok(guard) => {
                self.run(guard, TurnInput::UserText(text.into()), None, cancel)
                    .await
            }
            Err(detail) => TurnResult::Error { detail },
        }
    }

    /// Run a turn in the background, streaming its events.
    pub fn submit_turn_stream(&self, session_id: &SessionId, text: impl Into<String>) -> TurnHandle {
        self.spawn_turn(session_id, TurnInput::UserText(text.into()))
    }

    /// Supply the result of the pending terminal-for-turn tool and continue.
    pub async fn resume_turn(
        &self,
        session_id: &SessionId,
        tool_call_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> TurnResult {
        let input = TurnInput::Resume {
            tool_call_id: tool_call_id.into(),
            payload,
        };
        match self.acquire(session_id) {
            Ok(guard) => self.run(guard, input, None, &CancellationToken::new()).await,
            Err(detail) => TurnResult::Error { detail },
        }
    }

    pub fn resume_turn_stream(
        &self,
        session_id: &SessionId,
        tool_call_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> TurnHandle {
        self.spawn_turn(
            session_id,
            TurnInput::Resume {
                tool_call_id: tool_call_id.into(),
                payload,
            },
        )
    }

    pub async fn history(&self, session_id: &SessionId) -> Result<Vec<Message>, Error> {
        Ok(self.store.history(session_id).await?)
    }

    /// The tool call the session is waiting on, if any.
    pub async fn pending_tool(&self, session_id: &SessionId) -> Result<Option<PendingTool>, Error> {
        Ok(self.store.load(session_id).await?.pending_tool)
    }

    /// Forget a session. Refused while a turn is in flight.
    pub async fn reset(&self, session_id: &SessionId) -> Result<(), Error> {
        let _guard = self
            .acquire(session_id)
            .map_err(|_| Error::SessionBusy(session_id.to_string()))?;
        self.store.reset(session_id).await?;
        Ok(())
    }

    fn acquire(&self, session_id: &SessionId) -> Result<InFlightGuard, TurnError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(session_id.clone()) {
            debug!(session_id = %session_id, "Rejecting concurrent turn");
            return Err(TurnError::new(
                ErrorKind::SessionBusy,
                format!("a turn is already in flight for session {session_id}"),
            ));
        }
        Ok(InFlightGuard {
            in_flight: self.in_flight.clone(),
            session_id: session_id.clone(),
        })
    }

    fn spawn_turn(&self, session_id: &SessionId, input: TurnInput) -> TurnHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        match self.acquire(session_id) {
            Ok(guard) => {
                let service = self.clone();
                let token = cancel.clone();
                tokio::spawn(async move {
                    let result = service.run(guard, input, Some(&tx), &token).await;
                    let _ = tx.send(TurnEvent::Done { result }).await;
                });
            }
            Err(detail) => {
                // Fresh channel with spare capacity.
                let _ = tx.try_send(TurnEvent::Done {
                    result: TurnResult::Error { detail },
                });
            }
        }

        TurnHandle {
            events: rx,
            cancel: cancel.clone(),
            _cancel_on_drop: cancel.drop_guard(),
        }
    }

    /// Load, run, commit. The guard is released before this returns.
    async fn run(
        &self,
        guard: InFlightGuard,
        input: TurnInput,
        events: Option<&mpsc::Sender<TurnEvent>>,
        cancel: &CancellationToken,
    ) -> TurnResult {
        let session_id = guard.session_id.clone();
        let session = match self.store.load(&session_id).await {
            Ok(session) => session,
            Err(e) => return storage_failure(&session_id, e),
        };
        let committed_len = session.messages.len();
        let committed_pending = session.pending_tool.clone();

        let (session, result) = self
            .orchestrator
            .run_turn(session, input, events, cancel)
            .await;

        if let Err(e) = self
            .commit(&session_id, session, committed_len, committed_pending)
            .await
        {
            return storage_failure(&session_id, e);
        }
        drop(guard);
        result
    }

    // The orchestrator only ever appends, so the new messages are the tail.
    async fn commit(
        &self,
        session_id: &SessionId,
        session: Session,
        committed_len: usize,
        committed_pending: Option<PendingTool>,
    ) -> Result<(), StoreError> {
        let appended = session.messages.len().saturating_sub(committed_len);
        for message in session.messages.into_iter().skip(committed_len) {
            self.store.append(session_id, message).await?;
        }
        if session.pending_tool != committed_pending {
            self.store
                .set_pending(session_id, session.pending_tool)
                .await?;
        }
        debug!(session_id = %session_id, appended, "Committed turn");
        Ok(())
    }
}

/// Frees the session for the next turn when dropped.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<SessionId>>>,
    session_id: SessionId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

fn storage_failure(session_id: &SessionId, e: StoreError) -> TurnResult {
    error!(session_id = %session_id, error = %e, "Session store failed");
    TurnResult::error(ErrorKind::StorageFailure, e.to_string())
}

/// A turn running in the background.
///
/// Events arrive in order and always end with [`TurnEvent::Done`].
/// Dropping the handle cancels the turn.
pub struct TurnHandle {
    events: mpsc::Receiver<TurnEvent>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl TurnHandle {
    /// Stop the turn. The session is left as it was before the turn began.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this turn, e.g. for a Ctrl+C handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    /// Drain the remaining events and return the outcome.
    pub async fn finish(mut self) -> TurnResult {
        while let Some(event) = self.events.recv().await {
            if let TurnEvent::Done { result } = event {
                return result;
            }
        }
        TurnResult::error(ErrorKind::Cancelled, "turn ended without a result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_runner::OrchestratorSettings;
    use crate::test_helpers::*;
    use parley_core::message::Role;
    use parley_core::provider::Provider;
    use serde_json::json;

    fn service(provider: Arc<dyn Provider>, stream: bool) -> ChatService {
        let settings = OrchestratorSettings {
            stream,
            ..Default::default()
        };
        let tools = registry_with(vec![Box::new(EchoTool), Box::new(RecordingTool)]);
        ChatService::in_memory(Orchestrator::new(provider, tools, settings, 8192))
    }

    #[tokio::test]
    async fn turns_accumulate_history() {
        let provider = Arc::new(SequentialMockProvider::replies(vec![
            make_text_response("First answer."),
            make_text_response("Second answer."),
        ]));
        let chat = service(provider.clone(), false);
        let id = SessionId::from("s1");

        chat.submit_turn(&id, "first").await;
        let result = chat.submit_turn(&id, "second").await;
        assert_eq!(result.answer_text(), Some("Second answer."));

        let history = chat.history(&id).await.unwrap();
        assert_eq!(history.len(), 4);
        // System prompt + both exchanges so far.
        assert_eq!(provider.requests()[1].messages.len(), 4);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let provider = Arc::new(SequentialMockProvider::single_text("hi").repeating());
        let chat = service(provider, false);

        chat.submit_turn(&SessionId::from("a"), "one").await;
        chat.submit_turn(&SessionId::from("b"), "two").await;
        assert_eq!(chat.history(&SessionId::from("a")).await.unwrap().len(), 2);
        assert_eq!(chat.history(&SessionId::from("b")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn streaming_delivers_text_then_done() {
        let provider = Arc::new(SequentialMockProvider::single_text("Streamed answer."));
        let chat = service(provider, true);
        let id = SessionId::from("s1");

        let mut handle = chat.submit_turn_stream(&id, "hi");
        let mut text = String::new();
        let result = loop {
            match handle.next_event().await.expect("stream ended early") {
                TurnEvent::TextDelta { content } => text.push_str(&content),
                TurnEvent::Done { result } => break result,
                _ => {}
            }
        };
        assert_eq!(text, "Streamed answer.");
        assert_eq!(result.answer_text(), Some("Streamed answer."));
    }

    #[tokio::test]
    async fn streamed_text_keeps_tag_like_words() {
        for answer in [
            "Open the <toolbar> menu and click Save.",
            "Wrap the config in a <tool> element, then restart the server.",
        ] {
            let chat = service(Arc::new(SequentialMockProvider::single_text(answer)), true);
            let id = SessionId::from("s1");

            let mut handle = chat.submit_turn_stream(&id, "how?");
            let mut text = String::new();
            let result = loop {
                match handle.next_event().await.expect("stream ended early") {
                    TurnEvent::TextDelta { content } => text.push_str(&content),
                    TurnEvent::Done { result } => break result,
                    _ => {}
                }
            };
            assert_eq!(text, answer);
            assert_eq!(result.answer_text(), Some(answer));
            let stored = chat.history(&id).await.unwrap();
            assert_eq!(stored[1].content, answer);
        }
    }

    #[tokio::test]
    async fn a_busy_session_rejects_a_second_turn() {
        let provider = Arc::new(StallingStreamProvider::new("thinking"));
        let chat = service(provider, true);
        let id = SessionId::from("busy");

        let mut handle = chat.submit_turn_stream(&id, "first");
        // Wait until the first turn is streaming.
        assert!(matches!(
            handle.next_event().await,
            Some(TurnEvent::TextDelta { .. })
        ));

        let second = chat.submit_turn(&id, "second").await;
        assert_eq!(second.error_kind(), Some(ErrorKind::SessionBusy));
        assert!(matches!(chat.reset(&id).await, Err(Error::SessionBusy(_))));

        handle.cancel();
        assert_eq!(handle.finish().await.error_kind(), Some(ErrorKind::Cancelled));

        // The cancelled turn left nothing behind and the session is free again.
        assert!(chat.history(&id).await.unwrap().is_empty());
        chat.reset(&id).await.unwrap();
    }

    #[tokio::test]
    async fn busy_streams_report_through_done() {
        let provider = Arc::new(StallingStreamProvider::new("thinking"));
        let chat = service(provider, true);
        let id = SessionId::from("busy");

        let mut first = chat.submit_turn_stream(&id, "first");
        first.next_event().await;
        let second = chat.submit_turn_stream(&id, "second");
        assert_eq!(second.finish().await.error_kind(), Some(ErrorKind::SessionBusy));
    }

    #[tokio::test]
    async fn pending_tools_survive_between_calls() {
        let provider = Arc::new(SequentialMockProvider::replies(vec![
            make_tool_call_response(
                vec![make_tool_call("rec_1", "record", json!({"prompt": "Say cheese"}))],
                "",
            ),
            make_text_response("Lovely recording."),
        ]));
        let chat = service(provider, false);
        let id = SessionId::from("s1");

        let result = chat.submit_turn(&id, "record me").await;
        assert!(matches!(result, TurnResult::PendingTool { .. }));
        let pending = chat.pending_tool(&id).await.unwrap().unwrap();
        assert_eq!(pending.call.id, "rec_1");

        let result = chat.resume_turn(&id, "rec_1", json!({"file": "cheese.wav"})).await;
        assert_eq!(result.answer_text(), Some("Lovely recording."));
        assert!(chat.pending_tool(&id).await.unwrap().is_none());

        let roles: Vec<Role> = chat
            .history(&id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    }

    /// Loads fine, refuses to persist.
    struct ReadOnlyStore(InMemorySessionStore);

    #[async_trait::async_trait]
    impl SessionStore for ReadOnlyStore {
        async fn load(&self, id: &SessionId) -> Result<Session, StoreError> {
            self.0.load(id).await
        }
        async fn append(&self, _id: &SessionId, _message: Message) -> Result<(), StoreError> {
            Err(StoreError::Storage("disk is read-only".into()))
        }
        async fn history(&self, id: &SessionId) -> Result<Vec<Message>, StoreError> {
            self.0.history(id).await
        }
        async fn set_pending(
            &self,
            id: &SessionId,
            pending: Option<PendingTool>,
        ) -> Result<(), StoreError> {
            self.0.set_pending(id, pending).await
        }
        async fn reset(&self, id: &SessionId) -> Result<(), StoreError> {
            self.0.reset(id).await
        }
    }

    #[tokio::test]
    async fn store_failures_end_the_turn_with_storage_failure() {
        let provider = Arc::new(SequentialMockProvider::single_text("Never saved.").repeating());
        let tools = registry_with(vec![Box::new(EchoTool)]);
        let orchestrator = Orchestrator::new(provider, tools, OrchestratorSettings::default(), 8192);
        let chat = ChatService::new(
            Arc::new(ReadOnlyStore(InMemorySessionStore::new())),
            Arc::new(orchestrator),
        );
        let id = SessionId::from("ro");

        let result = chat.submit_turn(&id, "hello").await;
        assert_eq!(result.error_kind(), Some(ErrorKind::StorageFailure));
        let TurnResult::Error { detail } = &result else {
            panic!("expected an error, got {result:?}");
        };
        assert!(detail.message.contains("disk is read-only"));

        // The session is not left busy.
        let again = chat.submit_turn(&id, "hello again").await;
        assert_eq!(again.error_kind(), Some(ErrorKind::StorageFailure));
        assert!(chat.history(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_forgets_the_session() {
        let provider = Arc::new(SequentialMockProvider::single_text("hi").repeating());
        let chat = service(provider, false);
        let id = SessionId::from("s1");

        chat.submit_turn(&id, "hello").await;
        chat.reset(&id).await.unwrap();
        assert!(chat.history(&id).await.unwrap().is_empty());
    }
}
