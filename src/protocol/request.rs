//! Inbound login requests, normalized across protocols.
//!
//! SAML AuthnRequests are parsed from XML; OIDC authorize requests and
//! WS-Federation sign-in requests are normalized from their query
//! parameters. Downstream, the flow engine only ever sees a
//! [`LoginRequest`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::assurance::AssuranceLevel;
use crate::error::{IdpError, IdpResult};
use crate::party::Protocol;

/// Maximum allowed clock skew for IssueInstant validation (5 minutes)
const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Maximum age for an inbound request (5 minutes)
const MAX_REQUEST_AGE_SECS: i64 = 300;

/// Maximum length for the request ID attribute
const MAX_REQUEST_ID_LENGTH: usize = 256;

/// Maximum length for the issuer value
const MAX_ISSUER_LENGTH: usize = 1024;

const LOA_LOW: &str = "http://eidas.europa.eu/LoA/low";
const LOA_SUBSTANTIAL: &str = "http://eidas.europa.eu/LoA/substantial";
const LOA_HIGH: &str = "http://eidas.europa.eu/LoA/high";

/// A login request after protocol normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub protocol: Protocol,
    /// Wire-level request id; echoed as InResponseTo for SAML. OIDC and
    /// WS-Fed requests carry none.
    pub request_id: Option<String>,
    /// Entity id (SAML), client id (OIDC), or realm (WS-Fed) of the party.
    pub party_entity_id: String,
    /// Response destination requested by the party, if any.
    pub destination: Option<String>,
    /// Opaque state echoed back: RelayState, OIDC state, or wctx.
    pub relay_state: Option<String>,
    pub force_authn: bool,
    pub is_passive: bool,
    /// Level the party asked for, if it asked.
    pub requested_level: Option<AssuranceLevel>,
    pub name_id_format: Option<String>,
    /// OIDC nonce, echoed into the id token.
    pub nonce: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Parser for SAML AuthnRequest XML.
pub struct AuthnRequestParser;

impl AuthnRequestParser {
    pub fn parse(xml: &str) -> IdpResult<LoginRequest> {
        use quick_xml::events::Event;
        use quick_xml::Reader;

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut id = None;
        let mut issuer = None;
        let mut acs_url = None;
        let mut name_id_format = None;
        let mut is_passive = false;
        let mut force_authn = false;
        let mut issue_instant_raw = None;
        let mut context_class_ref = None;
        let mut in_issuer = false;
        let mut in_context_class_ref = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e) | Event::Empty(e)) => {
                    let local = e.local_name();
                    match std::str::from_utf8(local.as_ref()).unwrap_or("") {
                        "AuthnRequest" => {
                            for attr in e.attributes().flatten() {
                                let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                                let value = attr.unescape_value().unwrap_or_default();
                                match key {
                                    "ID" => id = Some(value.to_string()),
                                    "IssueInstant" => issue_instant_raw = Some(value.to_string()),
                                    "AssertionConsumerServiceURL" => {
                                        acs_url = Some(value.to_string());
                                    }
                                    "IsPassive" => is_passive = value == "true",
                                    "ForceAuthn" => force_authn = value == "true",
                                    _ => {}
                                }
                            }
                        }
                        "Issuer" => in_issuer = true,
                        "AuthnContextClassRef" => in_context_class_ref = true,
                        "NameIDPolicy" => {
                            for attr in e.attributes().flatten() {
                                let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
                                if key == "Format" {
                                    name_id_format =
                                        Some(attr.unescape_value().unwrap_or_default().to_string());
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::Text(e)) => {
                    let text = e.unescape().unwrap_or_default();
                    if in_issuer {
                        issuer = Some(text.to_string());
                    } else if in_context_class_ref {
                        context_class_ref = Some(text.to_string());
                    }
                }
                Ok(Event::End(e)) => {
                    let local = e.local_name();
                    match std::str::from_utf8(local.as_ref()).unwrap_or("") {
                        "Issuer" => in_issuer = false,
                        "AuthnContextClassRef" => in_context_class_ref = false,
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(IdpError::InvalidLoginRequest(format!("XML parse error: {e}")));
                }
                _ => {}
            }
        }

        let id = id
            .ok_or_else(|| IdpError::InvalidLoginRequest("missing ID attribute".to_string()))?;
        if id.len() > MAX_REQUEST_ID_LENGTH {
            return Err(IdpError::InvalidLoginRequest(format!(
                "ID attribute exceeds maximum length of {MAX_REQUEST_ID_LENGTH} characters"
            )));
        }

        let issuer = issuer
            .ok_or_else(|| IdpError::InvalidLoginRequest("missing Issuer element".to_string()))?;
        if issuer.len() > MAX_ISSUER_LENGTH {
            return Err(IdpError::InvalidLoginRequest(format!(
                "Issuer exceeds maximum length of {MAX_ISSUER_LENGTH} characters"
            )));
        }

        let issue_instant_str = issue_instant_raw.ok_or_else(|| {
            IdpError::InvalidLoginRequest("missing IssueInstant attribute".to_string())
        })?;
        let issue_instant = DateTime::parse_from_rfc3339(&issue_instant_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| IdpError::InvalidLoginRequest(format!("invalid IssueInstant: {e}")))?;
        validate_issue_instant(issue_instant)?;

        let requested_level = match context_class_ref.as_deref() {
            Some(uri) => Some(parse_loa(uri)?),
            None => None,
        };

        Ok(LoginRequest {
            protocol: Protocol::Saml2,
            request_id: Some(id),
            party_entity_id: issuer,
            destination: acs_url,
            relay_state: None,
            force_authn,
            is_passive,
            requested_level,
            name_id_format,
            nonce: None,
            received_at: Utc::now(),
        })
    }
}

fn validate_issue_instant(issue_instant: DateTime<Utc>) -> IdpResult<()> {
    let age_secs = (Utc::now() - issue_instant).num_seconds();
    if age_secs < -MAX_CLOCK_SKEW_SECS {
        return Err(IdpError::InvalidLoginRequest(format!(
            "IssueInstant is in the future (skew {}s exceeds {}s tolerance)",
            -age_secs, MAX_CLOCK_SKEW_SECS
        )));
    }
    if age_secs > MAX_REQUEST_AGE_SECS {
        return Err(IdpError::InvalidLoginRequest(format!(
            "IssueInstant is too old ({age_secs}s exceeds {MAX_REQUEST_AGE_SECS}s maximum)"
        )));
    }
    Ok(())
}

fn parse_loa(uri: &str) -> IdpResult<AssuranceLevel> {
    match uri {
        LOA_LOW => Ok(AssuranceLevel::Low),
        LOA_SUBSTANTIAL => Ok(AssuranceLevel::Substantial),
        LOA_HIGH => Ok(AssuranceLevel::High),
        other => Err(IdpError::InvalidLoginRequest(format!(
            "unsupported authentication context: {other}"
        ))),
    }
}

/// Normalize an OIDC authorization request from its query parameters.
pub fn normalize_oidc_request(params: &HashMap<String, String>) -> IdpResult<LoginRequest> {
    let client_id = params
        .get("client_id")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IdpError::InvalidLoginRequest("missing client_id".to_string()))?;

    match params.get("response_type").map(String::as_str) {
        Some("code") => {}
        Some(other) => {
            return Err(IdpError::InvalidLoginRequest(format!(
                "unsupported response_type: {other}"
            )));
        }
        None => {
            return Err(IdpError::InvalidLoginRequest(
                "missing response_type".to_string(),
            ));
        }
    }

    let prompt = params.get("prompt").map(String::as_str);
    let requested_level = match params.get("acr_values").map(String::as_str) {
        Some(uri) if !uri.is_empty() => Some(parse_loa(uri)?),
        _ => None,
    };

    Ok(LoginRequest {
        protocol: Protocol::Oidc,
        request_id: None,
        party_entity_id: client_id.clone(),
        destination: params.get("redirect_uri").cloned(),
        relay_state: params.get("state").cloned(),
        force_authn: prompt == Some("login"),
        is_passive: prompt == Some("none"),
        requested_level,
        name_id_format: None,
        nonce: params.get("nonce").cloned(),
        received_at: Utc::now(),
    })
}

/// Normalize a WS-Federation sign-in request (wa=wsignin1.0).
pub fn normalize_wsfed_request(params: &HashMap<String, String>) -> IdpResult<LoginRequest> {
    match params.get("wa").map(String::as_str) {
        Some("wsignin1.0") => {}
        other => {
            return Err(IdpError::InvalidLoginRequest(format!(
                "unsupported wa action: {other:?}"
            )));
        }
    }
    let realm = params
        .get("wtrealm")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IdpError::InvalidLoginRequest("missing wtrealm".to_string()))?;

    Ok(LoginRequest {
        protocol: Protocol::WsFed,
        request_id: None,
        party_entity_id: realm.clone(),
        destination: params.get("wreply").cloned(),
        relay_state: params.get("wctx").cloned(),
        force_authn: false,
        is_passive: false,
        requested_level: None,
        name_id_format: None,
        nonce: None,
        received_at: Utc::now(),
    })
}
