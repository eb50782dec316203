//! Parse inbound SAML LogoutRequest / LogoutResponse XML into plain values.

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{IdpError, IdpResult};

const MAX_ID_LENGTH: usize = 256;
const MAX_ISSUER_LENGTH: usize = 1024;
const MAX_NAME_ID_LENGTH: usize = 4096;

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// A LogoutRequest reduced to the values the orchestrator acts on.
#[derive(Debug, Clone)]
pub struct ParsedLogoutRequest {
    pub id: String,
    pub issuer: String,
    pub name_id: String,
    pub name_id_format: Option<String>,
    pub session_indexes: Vec<String>,
}

/// A LogoutResponse reduced to the values the orchestrator acts on.
#[derive(Debug, Clone)]
pub struct ParsedLogoutResponse {
    pub id: String,
    pub issuer: String,
    pub in_response_to: Option<String>,
    pub success: bool,
}

pub fn parse_logout_request(xml: &str) -> IdpResult<ParsedLogoutRequest> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut id = None;
    let mut issuer = None;
    let mut name_id = None;
    let mut name_id_format = None;
    let mut session_indexes = Vec::new();
    let mut current_element = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = String::from_utf8_lossy(e.local_name().into_inner()).to_string();
                current_element = local.clone();

                if local == "LogoutRequest" {
                    for attr in e.attributes().flatten() {
                        let key =
                            String::from_utf8_lossy(attr.key.local_name().into_inner()).to_string();
                        if key == "ID" {
                            id = Some(String::from_utf8_lossy(&attr.value).to_string());
                        }
                    }
                } else if local == "NameID" {
                    for attr in e.attributes().flatten() {
                        let key =
                            String::from_utf8_lossy(attr.key.local_name().into_inner()).to_string();
                        if key == "Format" {
                            name_id_format =
                                Some(String::from_utf8_lossy(&attr.value).to_string());
                        }
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                match current_element.as_str() {
                    "Issuer" => issuer = Some(text),
                    "NameID" => name_id = Some(text),
                    "SessionIndex" => session_indexes.push(text),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => {
                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(IdpError::InvalidLogoutMessage(format!(
                    "XML parse error: {e}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    let id = id.ok_or_else(|| {
        IdpError::InvalidLogoutMessage("Missing LogoutRequest ID".to_string())
    })?;
    let issuer =
        issuer.ok_or_else(|| IdpError::InvalidLogoutMessage("Missing Issuer".to_string()))?;
    let name_id =
        name_id.ok_or_else(|| IdpError::InvalidLogoutMessage("Missing NameID".to_string()))?;

    check_length("ID", &id, MAX_ID_LENGTH)?;
    check_length("Issuer", &issuer, MAX_ISSUER_LENGTH)?;
    check_length("NameID", &name_id, MAX_NAME_ID_LENGTH)?;
    for index in &session_indexes {
        check_length("SessionIndex", index, MAX_ID_LENGTH)?;
    }

    Ok(ParsedLogoutRequest {
        id,
        issuer,
        name_id,
        name_id_format,
        session_indexes,
    })
}

pub fn parse_logout_response(xml: &str) -> IdpResult<ParsedLogoutResponse> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut id = None;
    let mut issuer = None;
    let mut in_response_to = None;
    let mut status_code = None;
    let mut current_element = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = String::from_utf8_lossy(e.local_name().into_inner()).to_string();

                if local == "LogoutResponse" {
                    for attr in e.attributes().flatten() {
                        let key =
                            String::from_utf8_lossy(attr.key.local_name().into_inner()).to_string();
                        match key.as_str() {
                            "ID" => id = Some(String::from_utf8_lossy(&attr.value).to_string()),
                            "InResponseTo" => {
                                in_response_to =
                                    Some(String::from_utf8_lossy(&attr.value).to_string());
                            }
                            _ => {}
                        }
                    }
                } else if local == "StatusCode" && status_code.is_none() {
                    // Only the top-level code decides success; nested codes
                    // carry detail.
                    for attr in e.attributes().flatten() {
                        let key =
                            String::from_utf8_lossy(attr.key.local_name().into_inner()).to_string();
                        if key == "Value" {
                            status_code = Some(String::from_utf8_lossy(&attr.value).to_string());
                        }
                    }
                }
                current_element = local;
            }
            Ok(Event::Text(ref e)) => {
                if current_element == "Issuer" {
                    issuer = Some(e.unescape().unwrap_or_default().to_string());
                }
            }
            Ok(Event::End(_)) => {
                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(IdpError::InvalidLogoutMessage(format!(
                    "XML parse error: {e}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    let id = id.ok_or_else(|| {
        IdpError::InvalidLogoutMessage("Missing LogoutResponse ID".to_string())
    })?;
    let issuer =
        issuer.ok_or_else(|| IdpError::InvalidLogoutMessage("Missing Issuer".to_string()))?;
    let status_code =
        status_code.ok_or_else(|| IdpError::InvalidLogoutMessage("Missing Status".to_string()))?;

    check_length("ID", &id, MAX_ID_LENGTH)?;
    check_length("Issuer", &issuer, MAX_ISSUER_LENGTH)?;
    if let Some(ref irt) = in_response_to {
        check_length("InResponseTo", irt, MAX_ID_LENGTH)?;
    }

    Ok(ParsedLogoutResponse {
        id,
        issuer,
        in_response_to,
        success: status_code == STATUS_SUCCESS,
    })
}

fn check_length(field: &str, value: &str, max: usize) -> IdpResult<()> {
    if value.len() > max {
        return Err(IdpError::InvalidLogoutMessage(format!(
            "{field} too long (max {max})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_logout_request() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_lr_test123" Version="2.0" IssueInstant="2026-02-21T10:00:00Z"
    Destination="https://idp.example.com/saml/slo">
    <saml:Issuer>https://sp.example.com</saml:Issuer>
    <saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">user@example.com</saml:NameID>
    <samlp:SessionIndex>_session_abc123</samlp:SessionIndex>
</samlp:LogoutRequest>"#;

        let result = parse_logout_request(xml).unwrap();
        assert_eq!(result.id, "_lr_test123");
        assert_eq!(result.issuer, "https://sp.example.com");
        assert_eq!(result.name_id, "user@example.com");
        assert_eq!(
            result.name_id_format.as_deref(),
            Some("urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress")
        );
        assert_eq!(result.session_indexes, vec!["_session_abc123".to_string()]);
    }

    #[test]
    fn test_parse_logout_request_without_session_index() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_lr_test456" Version="2.0" IssueInstant="2026-02-21T10:00:00Z">
    <saml:Issuer>https://sp.example.com</saml:Issuer>
    <saml:NameID>user@example.com</saml:NameID>
</samlp:LogoutRequest>"#;

        let result = parse_logout_request(xml).unwrap();
        assert_eq!(result.id, "_lr_test456");
        assert!(result.session_indexes.is_empty());
        assert!(result.name_id_format.is_none());
    }

    #[test]
    fn test_parse_logout_request_missing_issuer() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr_test789" Version="2.0">
    <saml:NameID>user@example.com</saml:NameID>
</samlp:LogoutRequest>"#;

        assert!(matches!(
            parse_logout_request(xml),
            Err(IdpError::InvalidLogoutMessage(_))
        ));
    }

    #[test]
    fn test_parse_logout_response_success() {
        let xml = r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_lresp_1" Version="2.0" IssueInstant="2026-02-21T10:00:00Z"
    InResponseTo="_outbound_9">
    <saml:Issuer>https://sp.example.com</saml:Issuer>
    <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status>
</samlp:LogoutResponse>"#;

        let result = parse_logout_response(xml).unwrap();
        assert_eq!(result.issuer, "https://sp.example.com");
        assert_eq!(result.in_response_to.as_deref(), Some("_outbound_9"));
        assert!(result.success);
    }

    #[test]
    fn test_parse_logout_response_failure_status() {
        let xml = r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_lresp_2" Version="2.0" IssueInstant="2026-02-21T10:00:00Z">
    <saml:Issuer>https://sp.example.com</saml:Issuer>
    <samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Responder"/></samlp:Status>
</samlp:LogoutResponse>"#;

        let result = parse_logout_response(xml).unwrap();
        assert!(!result.success);
    }

    #[test]
    fn test_oversized_name_id_rejected() {
        let long = "x".repeat(5000);
        let xml = format!(
            r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr_1" Version="2.0">
    <saml:Issuer>https://sp.example.com</saml:Issuer>
    <saml:NameID>{long}</saml:NameID>
</samlp:LogoutRequest>"#
        );

        assert!(matches!(
            parse_logout_request(&xml),
            Err(IdpError::InvalidLogoutMessage(_))
        ));
    }
}
