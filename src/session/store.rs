//! Session persistence seam.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::SessionStoreError;
use crate::session::state::SessionState;

/// Backing store for browser sessions. The broker mutates a session by
/// loading it, applying changes, and writing it back; implementations only
/// need whole-record get/put/remove.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<SessionState>, SessionStoreError>;
    async fn put(&self, session: SessionState) -> Result<(), SessionStoreError>;
    async fn remove(&self, session_id: &str) -> Result<(), SessionStoreError>;
}

/// In-memory store for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionState>>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionState>, SessionStoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn put(&self, session: SessionState) -> Result<(), SessionStoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), SessionStoreError> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }
}
