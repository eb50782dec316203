//! Append-only security-event audit sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Kinds of security events the broker records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditAction {
    LoginRejectedByConditions,
    SessionExpired,
    LogoutCausedByIpChange,
    AssertionIssued,
    AuthorizationCodeIssued,
    SecurityTokenIssued,
    LogoutCompleted,
    ErrorResponseSent,
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    /// Subject id of the affected identity, when known.
    pub subject: Option<String>,
    /// Entity id of the relying party involved, when known.
    pub party: Option<String>,
    /// Free-form detail; for issuance events this carries the unsigned
    /// assertion/token content.
    pub detail: String,
}

impl AuditEvent {
    #[must_use]
    pub fn new(action: AuditAction, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            action,
            subject: None,
            party: None,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn party(mut self, party: impl Into<String>) -> Self {
        self.party = Some(party.into());
        self
    }
}

/// Append-only sink for audit events. Implementations must never drop or
/// reorder events within one session's request chain.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent);
}

/// In-memory audit sink for tests and development.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn count_of(&self, action: AuditAction) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) {
        tracing::debug!(action = ?event.action, subject = ?event.subject, "audit event");
        self.events.write().await.push(event);
    }
}
