//! Routing of terminal errors back to relying parties.
//!
//! When the failing exchange still has a resolvable destination the party
//! gets a signed SAML error message carrying the Requester/Responder status
//! and a sanitized message. Without a destination the caller clears the
//! session and sends the browser to the generic error page; nothing
//! internal leaves the broker either way.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::IdpConfig;
use crate::error::IdpError;
use crate::logout::builder;
use crate::party::{Binding, Endpoint, RelyingParty};
use crate::protocol::codec::{self, DeliveryInstruction};
use crate::protocol::LoginRequest;
use crate::token::signing::{sign_enveloped, SigningCredentials};
use crate::xml::xml_escape;

/// How a terminal error leaves the broker.
#[derive(Debug, Clone)]
pub enum ErrorDisposition {
    /// Signed SAML error message for the relying party.
    Respond(DeliveryInstruction),
    /// No destination could be resolved; the caller clears the session and
    /// redirects the browser here.
    RedirectToErrorPage { url: String },
}

pub struct ErrorResponder {
    config: IdpConfig,
    credentials: SigningCredentials,
    audit: Arc<dyn AuditSink>,
}

impl ErrorResponder {
    pub fn new(
        config: IdpConfig,
        credentials: SigningCredentials,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            credentials,
            audit,
        }
    }

    /// Answer a failed login exchange.
    pub async fn respond_login(
        &self,
        error: &IdpError,
        party: Option<&RelyingParty>,
        request: Option<&LoginRequest>,
    ) -> ErrorDisposition {
        let endpoint = party.and_then(|p| p.assertion_endpoint(Binding::Post));
        let (Some(party), Some(endpoint)) = (party, endpoint) else {
            return self.fallback(error, None).await;
        };

        let in_response_to = request.and_then(|r| r.request_id.as_deref());
        let relay_state = request.and_then(|r| r.relay_state.as_deref());
        let message = error.public_message();

        let (id, xml) =
            build_error_response(&self.config.entity_id, &endpoint.url, in_response_to, error, &message, Utc::now());
        match self.sign_and_deliver(&xml, &id, endpoint, "SAMLResponse", relay_state) {
            Ok(delivery) => {
                self.record(error, Some(&party.entity_id), &message).await;
                ErrorDisposition::Respond(delivery)
            }
            Err(e) => {
                tracing::error!(error = %e, "could not build signed error response");
                self.fallback(error, Some(&party.entity_id)).await
            }
        }
    }

    /// Answer a failed logout exchange.
    pub async fn respond_logout(
        &self,
        error: &IdpError,
        party: Option<&RelyingParty>,
        in_response_to: Option<&str>,
        relay_state: Option<&str>,
    ) -> ErrorDisposition {
        let endpoint = party.and_then(RelyingParty::logout_endpoint);
        let (Some(party), Some(endpoint)) = (party, endpoint) else {
            return self.fallback(error, None).await;
        };

        let message = error.public_message();
        let built = builder::build_logout_error_response(
            &self.config.entity_id,
            &endpoint.url,
            in_response_to,
            error.status(),
            &message,
            Utc::now(),
        );
        match self.sign_and_deliver(&built.xml, &built.id, endpoint, "SAMLResponse", relay_state) {
            Ok(delivery) => {
                self.record(error, Some(&party.entity_id), &message).await;
                ErrorDisposition::Respond(delivery)
            }
            Err(e) => {
                tracing::error!(error = %e, "could not build signed logout error response");
                self.fallback(error, Some(&party.entity_id)).await
            }
        }
    }

    fn sign_and_deliver(
        &self,
        xml: &str,
        id: &str,
        endpoint: &Endpoint,
        parameter: &str,
        relay_state: Option<&str>,
    ) -> Result<DeliveryInstruction, IdpError> {
        let signed = sign_enveloped(&self.credentials, xml, id)?;
        match endpoint.binding {
            Binding::Post => Ok(codec::post_delivery(
                &endpoint.url,
                parameter,
                &signed,
                relay_state,
            )),
            Binding::Redirect => {
                codec::redirect_delivery(&endpoint.url, parameter, &signed, relay_state)
            }
        }
    }

    async fn fallback(&self, error: &IdpError, party: Option<&str>) -> ErrorDisposition {
        self.record(error, party, &error.public_message()).await;
        ErrorDisposition::RedirectToErrorPage {
            url: format!("{}/error", self.config.base_url),
        }
    }

    async fn record(&self, error: &IdpError, party: Option<&str>, message: &str) {
        let mut event = AuditEvent::new(
            AuditAction::ErrorResponseSent,
            format!("{}: {message}", error.status().status_uri()),
        );
        if let Some(party) = party {
            event = event.party(party);
        }
        self.audit.append(event).await;
    }
}

/// Build an unsigned SAML Response carrying only a fault status.
fn build_error_response(
    idp_entity_id: &str,
    destination: &str,
    in_response_to: Option<&str>,
    error: &IdpError,
    message: &str,
    now: DateTime<Utc>,
) -> (String, String) {
    let id = format!("_resp_{}", Uuid::new_v4());
    let issue_instant = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let mut xml = String::new();
    xml.push_str("<samlp:Response xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\" xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\" ID=\"");
    xml.push_str(&id);
    xml.push_str("\" Version=\"2.0\" IssueInstant=\"");
    xml.push_str(&issue_instant);
    xml.push_str("\" Destination=\"");
    xml.push_str(&xml_escape(destination));
    xml.push('"');
    if let Some(irt) = in_response_to {
        xml.push_str(" InResponseTo=\"");
        xml.push_str(&xml_escape(irt));
        xml.push('"');
    }
    xml.push_str("><saml:Issuer>");
    xml.push_str(&xml_escape(idp_entity_id));
    xml.push_str("</saml:Issuer><samlp:Status><samlp:StatusCode Value=\"");
    xml.push_str(error.status().status_uri());
    xml.push_str("\"/><samlp:StatusMessage>");
    xml.push_str(&xml_escape(message));
    xml.push_str("</samlp:StatusMessage></samlp:Status></samlp:Response>");

    (id, xml)
}
