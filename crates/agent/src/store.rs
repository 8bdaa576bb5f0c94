//! In-memory session store.
//!
//! Sessions live for the lifetime of the process. Fine for a CLI and for
//! tests; a persistent store only has to implement [`SessionStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use parley_core::error::StoreError;
use parley_core::message::Message;
use parley_core::session::{PendingTool, Session, SessionId, SessionStore};
use tokio::sync::RwLock;

/// Thread-safe, in-memory store keyed by session id.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions seen so far.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &SessionId) -> Result<Session, StoreError> {
        if let Some(session) = self.sessions.read().await.get(id) {
            return Ok(session.clone());
        }
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(id.clone())
            .or_insert_with(|| Session::new(id.clone()));
        Ok(session.clone())
    }

    async fn append(&self, id: &SessionId, message: Message) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.clone())
            .or_insert_with(|| Session::new(id.clone()))
            .push(message);
        Ok(())
    }

    async fn history(&self, id: &SessionId) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(id)
            .map(|s| s.messages.clone())
            .unwrap_or_default())
    }

    async fn set_pending(
        &self,
        id: &SessionId,
        pending: Option<PendingTool>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.pending_tool = pending;
        Ok(())
    }

    async fn reset(&self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }
}
