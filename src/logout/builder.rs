//! Outbound LogoutRequest / LogoutResponse construction.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StatusKind;
use crate::xml::xml_escape;

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Inputs for one outbound LogoutRequest.
#[derive(Debug, Clone)]
pub struct LogoutRequestInput {
    pub idp_entity_id: String,
    pub destination: String,
    pub name_id: String,
    pub name_id_format: String,
    pub session_index: Option<String>,
}

/// A built logout message plus the id the caller correlates the answer by.
#[derive(Debug, Clone)]
pub struct BuiltLogoutMessage {
    pub id: String,
    pub xml: String,
}

/// Build an unsigned LogoutRequest addressed to one relying party.
#[must_use]
pub fn build_logout_request(input: &LogoutRequestInput, now: DateTime<Utc>) -> BuiltLogoutMessage {
    let id = format!("_lreq_{}", Uuid::new_v4());
    let issue_instant = format_instant(now);

    let mut xml = String::new();
    xml.push_str("<samlp:LogoutRequest xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\" xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\" ID=\"");
    xml.push_str(&id);
    xml.push_str("\" Version=\"2.0\" IssueInstant=\"");
    xml.push_str(&issue_instant);
    xml.push_str("\" Destination=\"");
    xml.push_str(&xml_escape(&input.destination));
    xml.push_str("\"><saml:Issuer>");
    xml.push_str(&xml_escape(&input.idp_entity_id));
    xml.push_str("</saml:Issuer><saml:NameID Format=\"");
    xml.push_str(&xml_escape(&input.name_id_format));
    xml.push_str("\">");
    xml.push_str(&xml_escape(&input.name_id));
    xml.push_str("</saml:NameID>");
    if let Some(ref index) = input.session_index {
        xml.push_str("<samlp:SessionIndex>");
        xml.push_str(&xml_escape(index));
        xml.push_str("</samlp:SessionIndex>");
    }
    xml.push_str("</samlp:LogoutRequest>");

    BuiltLogoutMessage { id, xml }
}

/// Build an unsigned success LogoutResponse.
#[must_use]
pub fn build_logout_response(
    idp_entity_id: &str,
    destination: &str,
    in_response_to: Option<&str>,
    now: DateTime<Utc>,
) -> BuiltLogoutMessage {
    build_status_response(
        idp_entity_id,
        destination,
        in_response_to,
        STATUS_SUCCESS,
        None,
        now,
    )
}

/// Build an unsigned LogoutResponse carrying a fault status.
#[must_use]
pub fn build_logout_error_response(
    idp_entity_id: &str,
    destination: &str,
    in_response_to: Option<&str>,
    status: StatusKind,
    message: &str,
    now: DateTime<Utc>,
) -> BuiltLogoutMessage {
    build_status_response(
        idp_entity_id,
        destination,
        in_response_to,
        status.status_uri(),
        Some(message),
        now,
    )
}

fn build_status_response(
    idp_entity_id: &str,
    destination: &str,
    in_response_to: Option<&str>,
    status_uri: &str,
    status_message: Option<&str>,
    now: DateTime<Utc>,
) -> BuiltLogoutMessage {
    let id = format!("_lresp_{}", Uuid::new_v4());
    let issue_instant = format_instant(now);

    let mut xml = String::new();
    xml.push_str("<samlp:LogoutResponse xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\" xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\" ID=\"");
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
    xml.push_str(status_uri);
    xml.push_str("\"/>");
    if let Some(message) = status_message {
        xml.push_str("<samlp:StatusMessage>");
        xml.push_str(&xml_escape(message));
        xml.push_str("</samlp:StatusMessage>");
    }
    xml.push_str("</samlp:Status></samlp:LogoutResponse>");

    BuiltLogoutMessage { id, xml }
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
