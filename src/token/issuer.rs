//! Token issuance, dispatched on the relying party's protocol.

use chrono::Utc;
use std::sync::Arc;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::IdpConfig;
use crate::directory::Identity;
use crate::error::{IdpError, IdpResult};
use crate::party::{Binding, Endpoint, Protocol, RelyingParty};
use crate::protocol::codec::{self, DeliveryInstruction};
use crate::protocol::LoginRequest;
use crate::session::SessionState;
use crate::token::assertion::{self, AssertionInput};
use crate::token::oidc::AuthorizationCodeService;
use crate::token::signing::{sign_enveloped, SigningCredentials};
use crate::token::{encryption, wsfed};

const NAME_ID_FORMAT_EMAIL: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

pub struct TokenIssuer {
    config: IdpConfig,
    credentials: SigningCredentials,
    codes: Arc<AuthorizationCodeService>,
    audit: Arc<dyn AuditSink>,
}

impl TokenIssuer {
    pub fn new(
        config: IdpConfig,
        credentials: SigningCredentials,
        codes: Arc<AuthorizationCodeService>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            credentials,
            codes,
            audit,
        }
    }

    /// Issue the protocol-appropriate token and record the party session.
    /// Any signing or encryption failure aborts the whole response.
    pub async fn issue(
        &self,
        session: &mut SessionState,
        party: &RelyingParty,
        request: &LoginRequest,
        identity: &Identity,
    ) -> IdpResult<DeliveryInstruction> {
        match party.protocol {
            Protocol::Saml2 => self.issue_saml(session, party, request, identity).await,
            Protocol::Oidc => self.issue_oidc(session, party, request, identity).await,
            Protocol::WsFed => self.issue_wsfed(session, party, request, identity).await,
        }
    }

    async fn issue_saml(
        &self,
        session: &mut SessionState,
        party: &RelyingParty,
        request: &LoginRequest,
        identity: &Identity,
    ) -> IdpResult<DeliveryInstruction> {
        let now = Utc::now();
        let endpoint = resolve_endpoint(party, request.destination.as_deref())?;

        let input = AssertionInput {
            idp_entity_id: self.config.entity_id.clone(),
            party_entity_id: party.entity_id.clone(),
            destination: endpoint.url.clone(),
            name_id: name_id_for(party, identity),
            name_id_format: party.name_id_format.clone(),
            in_response_to: request.request_id.clone(),
            attributes: party.attributes_for(identity),
        };

        let built = assertion::build_assertion(&input, now);
        let signed = sign_enveloped(&self.credentials, &built.xml, &built.assertion_id)?;

        let payload = if self.config.encrypt_assertions || party.encrypt_assertions {
            let cert = party.certificates.first().ok_or_else(|| {
                IdpError::MissingCertificate {
                    entity_id: party.entity_id.clone(),
                    usage: "encryption",
                }
            })?;
            encryption::encrypt_assertion(&signed, cert)?
        } else {
            signed
        };

        let response_xml = assertion::wrap_in_response(&input, &payload, now)?;

        // Audited only once the whole response exists. The entry carries
        // the pre-signature XML.
        self.audit
            .append(
                AuditEvent::new(AuditAction::AssertionIssued, &built.xml)
                    .subject(&identity.subject_id)
                    .party(&party.entity_id),
            )
            .await;

        session.record_party_session(
            &party.entity_id,
            &built.session_index,
            input.attributes.clone(),
            now,
        );
        tracing::info!(
            party = %party.entity_id,
            assertion_id = %built.assertion_id,
            "SAML assertion issued"
        );

        Ok(match endpoint.binding {
            Binding::Post => codec::post_delivery(
                &endpoint.url,
                "SAMLResponse",
                &response_xml,
                request.relay_state.as_deref(),
            ),
            Binding::Redirect => codec::redirect_delivery(
                &endpoint.url,
                "SAMLResponse",
                &response_xml,
                request.relay_state.as_deref(),
            )?,
        })
    }

    async fn issue_oidc(
        &self,
        session: &mut SessionState,
        party: &RelyingParty,
        request: &LoginRequest,
        identity: &Identity,
    ) -> IdpResult<DeliveryInstruction> {
        let endpoint = resolve_endpoint(party, request.destination.as_deref())?;
        let code = self
            .codes
            .issue(&party.entity_id, &identity.subject_id, request.nonce.as_deref())
            .await?;

        self.audit
            .append(
                AuditEvent::new(AuditAction::AuthorizationCodeIssued, "authorization code")
                    .subject(&identity.subject_id)
                    .party(&party.entity_id),
            )
            .await;

        session.record_party_session(
            &party.entity_id,
            &code,
            party.attributes_for(identity),
            Utc::now(),
        );

        let separator = if endpoint.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{separator}code={}",
            endpoint.url,
            urlencoding::encode(&code)
        );
        if let Some(state) = &request.relay_state {
            url.push_str("&state=");
            url.push_str(&urlencoding::encode(state));
        }
        Ok(DeliveryInstruction::Redirect { url })
    }

    async fn issue_wsfed(
        &self,
        session: &mut SessionState,
        party: &RelyingParty,
        request: &LoginRequest,
        identity: &Identity,
    ) -> IdpResult<DeliveryInstruction> {
        let now = Utc::now();
        let endpoint = resolve_endpoint(party, request.destination.as_deref())?;

        let input = AssertionInput {
            idp_entity_id: self.config.entity_id.clone(),
            party_entity_id: party.entity_id.clone(),
            destination: endpoint.url.clone(),
            name_id: name_id_for(party, identity),
            name_id_format: party.name_id_format.clone(),
            in_response_to: None,
            attributes: party.attributes_for(identity),
        };
        let built = assertion::build_assertion(&input, now);
        let signed = sign_enveloped(&self.credentials, &built.xml, &built.assertion_id)?;
        let rstr = wsfed::wrap_in_rstr(&signed, &party.entity_id, now);

        self.audit
            .append(
                AuditEvent::new(AuditAction::SecurityTokenIssued, &built.xml)
                    .subject(&identity.subject_id)
                    .party(&party.entity_id),
            )
            .await;

        session.record_party_session(
            &party.entity_id,
            &built.session_index,
            input.attributes.clone(),
            now,
        );

        let mut fields = vec![
            ("wa".to_string(), "wsignin1.0".to_string()),
            ("wresult".to_string(), rstr),
        ];
        if let Some(ctx) = &request.relay_state {
            fields.push(("wctx".to_string(), ctx.clone()));
        }
        Ok(DeliveryInstruction::Post {
            url: endpoint.url.clone(),
            fields,
        })
    }
}

/// Responses only ever go to endpoints the party registered. A requested
/// destination must match one of them after normalization.
fn resolve_endpoint<'a>(
    party: &'a RelyingParty,
    requested: Option<&str>,
) -> IdpResult<&'a Endpoint> {
    match requested {
        Some(url) => {
            let normalized = normalize_url(url)?;
            party
                .assertion_endpoints
                .iter()
                .find(|e| normalize_url(&e.url).as_deref() == Ok(normalized.as_str()))
                .ok_or_else(|| {
                    IdpError::InvalidLoginRequest(format!("destination {url} is not registered"))
                })
        }
        None => party
            .assertion_endpoint(Binding::Post)
            .ok_or_else(|| IdpError::MetadataUnavailable(format!(
                "no assertion endpoint for {}",
                party.entity_id
            ))),
    }
}

/// Lowercase scheme and host, strip the trailing slash; query survives.
fn normalize_url(url_str: &str) -> IdpResult<String> {
    let parsed = url::Url::parse(url_str)
        .map_err(|e| IdpError::InvalidLoginRequest(format!("invalid destination URL: {e}")))?;

    let mut normalized = format!(
        "{}://{}",
        parsed.scheme().to_lowercase(),
        parsed.host_str().unwrap_or("").to_lowercase()
    );
    if let Some(port) = parsed.port() {
        normalized.push(':');
        normalized.push_str(&port.to_string());
    }
    normalized.push_str(parsed.path().trim_end_matches('/'));
    if let Some(query) = parsed.query() {
        normalized.push('?');
        normalized.push_str(query);
    }
    Ok(normalized)
}

fn name_id_for(party: &RelyingParty, identity: &Identity) -> String {
    if party.name_id_format == NAME_ID_FORMAT_EMAIL {
        if let Some(email) = identity.attributes.get("email") {
            return email.clone();
        }
    }
    identity.subject_id.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_destination_rejected() {
        let party = RelyingParty {
            entity_id: "https://sp.example.com".into(),
            name: "SP".into(),
            protocol: Protocol::Saml2,
            enabled: true,
            assertion_endpoints: vec![Endpoint {
                binding: Binding::Post,
                url: "https://sp.example.com/acs".into(),
            }],
            logout_endpoints: vec![],
            certificates: vec![],
            validate_signatures: false,
            encrypt_assertions: false,
            mfa_policy: crate::party::MfaPolicy::default(),
            skip_mfa_on_trusted_network: false,
            required_level: None,
            prefer_eid: false,
            self_service: false,
            claims_selectable: false,
            required_claims: vec![],
            name_id_format: "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent".into(),
            released_claims: vec![],
        };

        assert!(resolve_endpoint(&party, Some("https://evil.example.com/acs")).is_err());
        assert_eq!(
            resolve_endpoint(&party, Some("https://sp.example.com/acs"))
                .unwrap()
                .url,
            "https://sp.example.com/acs"
        );
        assert_eq!(
            resolve_endpoint(&party, None).unwrap().url,
            "https://sp.example.com/acs"
        );
        // Host case and trailing slashes do not defeat the match.
        assert!(resolve_endpoint(&party, Some("https://SP.example.com/acs/")).is_ok());
    }
}
