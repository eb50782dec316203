//! Single-logout chain driver.
//!
//! The chain runs one relying party at a time and round-trips through the
//! session store between hops: the next party is taken from the session's
//! party map, a signed LogoutRequest goes out, and the party is removed
//! only when its LogoutResponse confirms. When the map is empty the origin
//! caller gets a signed LogoutResponse and the session is invalidated.

use chrono::Utc;
use std::sync::Arc;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::IdpConfig;
use crate::error::{IdpError, IdpResult};
use crate::logout::builder::{self, LogoutRequestInput};
use crate::logout::parser;
use crate::party::{Binding, Endpoint, PartyRegistry, RelyingParty};
use crate::protocol::codec::{self, DeliveryInstruction};
use crate::protocol::SignatureValidator;
use crate::session::{PendingLogout, SessionState, SessionStore};
use crate::token::signing::{sign_enveloped, SigningCredentials};

/// What the caller does next with the chain.
#[derive(Debug, Clone)]
pub enum LogoutStep {
    /// Send this LogoutRequest and re-enter with the party's response.
    NextParty {
        entity_id: String,
        delivery: DeliveryInstruction,
    },
    /// Chain finished. The delivery answers the originating party; absent
    /// for broker-initiated logout.
    Complete { delivery: Option<DeliveryInstruction> },
}

pub struct LogoutOrchestrator {
    config: IdpConfig,
    credentials: SigningCredentials,
    store: Arc<dyn SessionStore>,
    registry: Arc<PartyRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl LogoutOrchestrator {
    pub fn new(
        config: IdpConfig,
        credentials: SigningCredentials,
        store: Arc<dyn SessionStore>,
        registry: Arc<PartyRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            credentials,
            store,
            registry,
            audit,
        }
    }

    /// Handle a LogoutRequest from a relying party and start the chain.
    ///
    /// `binding` is how the message arrived: POST messages carry an
    /// enveloped signature checked here; Redirect messages are query-signed
    /// and the transport validates those before calling in.
    pub async fn process_request(
        &self,
        session_id: &str,
        xml: &str,
        binding: Binding,
        relay_state: Option<&str>,
    ) -> IdpResult<LogoutStep> {
        let mut session = self
            .store
            .get(session_id)
            .await?
            .ok_or(IdpError::SessionNotFound)?;

        if session.pending_login.is_some() {
            return Err(IdpError::FlowStateViolation(
                "login request still unresolved".to_string(),
            ));
        }

        let parsed = parser::parse_logout_request(xml)?;
        let party = self.registry.find(&parsed.issuer).await?;
        self.validate_inbound(&party, xml, binding)?;

        if let Some(identity) = &session.identity {
            if parsed.name_id != identity.subject_id {
                return Err(IdpError::InvalidLogoutMessage(
                    "NameID does not match the session identity".to_string(),
                ));
            }
        }

        tracing::info!(
            party = %parsed.issuer,
            request_id = %parsed.id,
            "logout chain started by relying party"
        );

        session.party_sessions.remove(&parsed.issuer);
        session.logout_reset();
        session.pending_logout = Some(PendingLogout {
            origin_request_id: Some(parsed.id),
            origin_entity_id: Some(parsed.issuer),
            origin_relay_state: relay_state.map(str::to_string),
            outbound_entity_id: None,
        });

        self.advance(session).await
    }

    /// Handle a LogoutResponse from the party the chain is waiting on.
    pub async fn process_response(
        &self,
        session_id: &str,
        xml: &str,
        binding: Binding,
    ) -> IdpResult<LogoutStep> {
        let mut session = self
            .store
            .get(session_id)
            .await?
            .ok_or(IdpError::SessionNotFound)?;

        let parsed = parser::parse_logout_response(xml)?;
        let party = self.registry.find(&parsed.issuer).await?;
        self.validate_inbound(&party, xml, binding)?;

        let pending = session.pending_logout.as_ref().ok_or_else(|| {
            IdpError::FlowStateViolation("no logout chain in progress".to_string())
        })?;
        if pending.outbound_entity_id.as_deref() != Some(parsed.issuer.as_str()) {
            return Err(IdpError::FlowStateViolation(format!(
                "unexpected LogoutResponse from {}",
                parsed.issuer
            )));
        }

        if !parsed.success {
            // The party could not terminate its own session. The chain
            // continues; its entry is still dropped here.
            tracing::warn!(party = %parsed.issuer, "relying party reported logout failure");
        }

        session.party_sessions.remove(&parsed.issuer);
        self.advance(session).await
    }

    /// Start a broker-initiated chain with no originating party.
    pub async fn initiate(&self, session_id: &str) -> IdpResult<LogoutStep> {
        let mut session = self
            .store
            .get(session_id)
            .await?
            .ok_or(IdpError::SessionNotFound)?;

        if session.pending_login.is_some() {
            return Err(IdpError::FlowStateViolation(
                "login request still unresolved".to_string(),
            ));
        }

        session.logout_reset();
        session.pending_logout = Some(PendingLogout {
            origin_request_id: None,
            origin_entity_id: None,
            origin_relay_state: None,
            outbound_entity_id: None,
        });

        self.advance(session).await
    }

    /// Emit the next hop, or close the chain when no parties remain. The
    /// session is persisted before any outbound work so a failed hop never
    /// loses progress.
    async fn advance(&self, mut session: SessionState) -> IdpResult<LogoutStep> {
        let next = session
            .party_sessions
            .iter()
            .next()
            .map(|(entity_id, ps)| (entity_id.clone(), ps.session_index.clone()));

        if let Some((entity_id, session_index)) = next {
            if let Some(pending) = session.pending_logout.as_mut() {
                pending.outbound_entity_id = Some(entity_id.clone());
            }
            self.store.put(session.clone()).await?;

            let party = self.registry.find(&entity_id).await?;
            let endpoint = party
                .logout_endpoint()
                .ok_or_else(|| IdpError::MissingLogoutEndpoint(entity_id.clone()))?;
            let identity = session.identity.as_ref().ok_or_else(|| {
                IdpError::FlowStateViolation("logout chain without an identity".to_string())
            })?;

            let built = builder::build_logout_request(
                &LogoutRequestInput {
                    idp_entity_id: self.config.entity_id.clone(),
                    destination: endpoint.url.clone(),
                    name_id: identity.subject_id.clone(),
                    name_id_format: party.name_id_format.clone(),
                    session_index: Some(session_index),
                },
                Utc::now(),
            );
            let signed = sign_enveloped(&self.credentials, &built.xml, &built.id)?;
            let delivery = deliver(endpoint, "SAMLRequest", &signed, None)?;

            tracing::info!(
                party = %entity_id,
                remaining = session.party_sessions.len(),
                "logout chain hop"
            );
            return Ok(LogoutStep::NextParty {
                entity_id,
                delivery,
            });
        }

        let pending = session.pending_logout.clone().unwrap_or(PendingLogout {
            origin_request_id: None,
            origin_entity_id: None,
            origin_relay_state: None,
            outbound_entity_id: None,
        });

        let delivery = match pending.origin_entity_id {
            Some(ref origin) => {
                let party = self.registry.find(&origin).await?;
                let endpoint = party
                    .logout_endpoint()
                    .ok_or_else(|| IdpError::MissingLogoutEndpoint(origin.clone()))?;
                let built = builder::build_logout_response(
                    &self.config.entity_id,
                    &endpoint.url,
                    pending.origin_request_id.as_deref(),
                    Utc::now(),
                );
                let signed = sign_enveloped(&self.credentials, &built.xml, &built.id)?;
                Some(deliver(
                    endpoint,
                    "SAMLResponse",
                    &signed,
                    pending.origin_relay_state.as_deref(),
                )?)
            }
            None => None,
        };

        let mut event = AuditEvent::new(AuditAction::LogoutCompleted, "single logout completed");
        if let Some(identity) = &session.identity {
            event = event.subject(&identity.subject_id);
        }
        if let Some(origin) = pending
            .origin_entity_id
            .as_deref()
            .filter(|origin| !origin.is_empty())
        {
            event = event.party(origin);
        }
        self.audit.append(event).await;

        self.store.remove(&session.id).await?;
        tracing::info!(session = %session.id, "logout chain complete, session invalidated");

        Ok(LogoutStep::Complete { delivery })
    }

    fn validate_inbound(
        &self,
        party: &RelyingParty,
        xml: &str,
        binding: Binding,
    ) -> IdpResult<()> {
        if party.validate_signatures && binding == Binding::Post {
            SignatureValidator::validate_enveloped(xml, &party.certificates)?;
        }
        Ok(())
    }
}

fn deliver(
    endpoint: &Endpoint,
    parameter: &str,
    xml: &str,
    relay_state: Option<&str>,
) -> IdpResult<DeliveryInstruction> {
    match endpoint.binding {
        Binding::Post => Ok(codec::post_delivery(&endpoint.url, parameter, xml, relay_state)),
        Binding::Redirect => codec::redirect_delivery(&endpoint.url, parameter, xml, relay_state),
    }
}
