//! SAML Response and Assertion construction.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::IdpResult;
use crate::xml::xml_escape;

/// Bearer subject confirmations are short-lived.
const BEARER_VALIDITY_MINUTES: i64 = 5;

/// Audience restriction window.
const CONDITIONS_VALIDITY_MINUTES: i64 = 60;

const AUTHN_CONTEXT_PASSWORD_PROTECTED: &str =
    "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport";

/// Inputs for one assertion.
#[derive(Debug, Clone)]
pub struct AssertionInput {
    pub idp_entity_id: String,
    pub party_entity_id: String,
    pub destination: String,
    pub name_id: String,
    pub name_id_format: String,
    /// Echoed back as InResponseTo; absent for unsolicited responses.
    pub in_response_to: Option<String>,
    pub attributes: Vec<(String, String)>,
}

/// A built assertion plus the identifiers the caller records.
#[derive(Debug, Clone)]
pub struct BuiltAssertion {
    pub assertion_id: String,
    /// Session index placed in the AuthnStatement; equals the assertion id.
    pub session_index: String,
    pub xml: String,
}

/// Build the unsigned Assertion element.
pub fn build_assertion(input: &AssertionInput, now: DateTime<Utc>) -> BuiltAssertion {
    let assertion_id = format!("_assert_{}", Uuid::new_v4());
    let issue_instant = format_instant(now);
    let not_before = format_instant(now - Duration::minutes(2));
    let bearer_not_on_or_after = format_instant(now + Duration::minutes(BEARER_VALIDITY_MINUTES));
    let conditions_not_on_or_after =
        format_instant(now + Duration::minutes(CONDITIONS_VALIDITY_MINUTES));

    let in_response_to_attr = input
        .in_response_to
        .as_deref()
        .map(|id| format!(" InResponseTo=\"{}\"", xml_escape(id)))
        .unwrap_or_default();

    let mut xml = String::new();
    xml.push_str("<saml:Assertion xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\" ID=\"");
    xml.push_str(&assertion_id);
    xml.push_str("\" Version=\"2.0\" IssueInstant=\"");
    xml.push_str(&issue_instant);
    xml.push_str("\"><saml:Issuer>");
    xml.push_str(&xml_escape(&input.idp_entity_id));
    xml.push_str("</saml:Issuer><saml:Subject><saml:NameID Format=\"");
    xml.push_str(&xml_escape(&input.name_id_format));
    xml.push_str("\">");
    xml.push_str(&xml_escape(&input.name_id));
    xml.push_str(
        "</saml:NameID><saml:SubjectConfirmation Method=\"urn:oasis:names:tc:SAML:2.0:cm:bearer\"><saml:SubjectConfirmationData NotOnOrAfter=\"",
    );
    xml.push_str(&bearer_not_on_or_after);
    xml.push_str("\" Recipient=\"");
    xml.push_str(&xml_escape(&input.destination));
    xml.push('"');
    xml.push_str(&in_response_to_attr);
    xml.push_str("/></saml:SubjectConfirmation></saml:Subject><saml:Conditions NotBefore=\"");
    xml.push_str(&not_before);
    xml.push_str("\" NotOnOrAfter=\"");
    xml.push_str(&conditions_not_on_or_after);
    xml.push_str("\"><saml:AudienceRestriction><saml:Audience>");
    xml.push_str(&xml_escape(&input.party_entity_id));
    xml.push_str(
        "</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AuthnStatement AuthnInstant=\"",
    );
    xml.push_str(&issue_instant);
    xml.push_str("\" SessionIndex=\"");
    xml.push_str(&assertion_id);
    xml.push_str("\"><saml:AuthnContext><saml:AuthnContextClassRef>");
    xml.push_str(AUTHN_CONTEXT_PASSWORD_PROTECTED);
    xml.push_str("</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement>");
    xml.push_str(&attributes_xml(&input.attributes));
    xml.push_str("</saml:Assertion>");

    BuiltAssertion {
        session_index: assertion_id.clone(),
        assertion_id,
        xml,
    }
}

/// Wrap an assertion (signed or encrypted) in a success Response.
pub fn wrap_in_response(
    input: &AssertionInput,
    assertion_xml: &str,
    now: DateTime<Utc>,
) -> IdpResult<String> {
    let response_id = format!("_resp_{}", Uuid::new_v4());
    let issue_instant = format_instant(now);
    let in_response_to_attr = input
        .in_response_to
        .as_deref()
        .map(|id| format!(" InResponseTo=\"{}\"", xml_escape(id)))
        .unwrap_or_default();

    let mut xml = String::new();
    xml.push_str("<samlp:Response xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\" xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\" ID=\"");
    xml.push_str(&response_id);
    xml.push_str("\" Version=\"2.0\" IssueInstant=\"");
    xml.push_str(&issue_instant);
    xml.push_str("\" Destination=\"");
    xml.push_str(&xml_escape(&input.destination));
    xml.push('"');
    xml.push_str(&in_response_to_attr);
    xml.push_str("><saml:Issuer>");
    xml.push_str(&xml_escape(&input.idp_entity_id));
    xml.push_str("</saml:Issuer><samlp:Status><samlp:StatusCode Value=\"urn:oasis:names:tc:SAML:2.0:status:Success\"/></samlp:Status>");
    xml.push_str(assertion_xml);
    xml.push_str("</samlp:Response>");
    Ok(xml)
}

fn attributes_xml(attributes: &[(String, String)]) -> String {
    if attributes.is_empty() {
        return String::new();
    }
    let mut xml = String::from("<saml:AttributeStatement>");
    for (name, value) in attributes {
        xml.push_str("<saml:Attribute Name=\"");
        xml.push_str(&xml_escape(name));
        xml.push_str("\"><saml:AttributeValue xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" xsi:type=\"xs:string\">");
        xml.push_str(&xml_escape(value));
        xml.push_str("</saml:AttributeValue></saml:Attribute>");
    }
    xml.push_str("</saml:AttributeStatement>");
    xml
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> AssertionInput {
        AssertionInput {
            idp_entity_id: "https://idp.example.com/metadata".into(),
            party_entity_id: "https://sp.example.com".into(),
            destination: "https://sp.example.com/acs".into(),
            name_id: "user@example.com".into(),
            name_id_format: "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress".into(),
            in_response_to: Some("_req1".into()),
            attributes: vec![("email".into(), "user@example.com".into())],
        }
    }

    #[test]
    fn test_session_index_equals_assertion_id() {
        let built = build_assertion(&input(), Utc::now());
        assert_eq!(built.assertion_id, built.session_index);
        assert!(built
            .xml
            .contains(&format!("SessionIndex=\"{}\"", built.assertion_id)));
    }

    #[test]
    fn test_bearer_confirmation_carries_in_response_to() {
        let built = build_assertion(&input(), Utc::now());
        assert!(built.xml.contains("Method=\"urn:oasis:names:tc:SAML:2.0:cm:bearer\""));
        assert!(built.xml.contains("InResponseTo=\"_req1\""));
        assert!(built.xml.contains("Recipient=\"https://sp.example.com/acs\""));
    }

    #[test]
    fn test_unsolicited_has_no_in_response_to() {
        let mut i = input();
        i.in_response_to = None;
        let built = build_assertion(&i, Utc::now());
        assert!(!built.xml.contains("InResponseTo"));
    }

    #[test]
    fn test_bearer_window_shorter_than_conditions() {
        let now = Utc::now();
        let built = build_assertion(&input(), now);
        let bearer = format_instant(now + Duration::minutes(BEARER_VALIDITY_MINUTES));
        let audience = format_instant(now + Duration::minutes(CONDITIONS_VALIDITY_MINUTES));
        assert!(built.xml.contains(&format!("NotOnOrAfter=\"{bearer}\"")));
        assert!(built.xml.contains(&format!("NotOnOrAfter=\"{audience}\"")));
    }

    #[test]
    fn test_response_wraps_assertion_with_success_status() {
        let now = Utc::now();
        let built = build_assertion(&input(), now);
        let response = wrap_in_response(&input(), &built.xml, now).unwrap();
        assert!(response.contains("urn:oasis:names:tc:SAML:2.0:status:Success"));
        assert!(response.contains(&built.xml));
        assert!(response.contains("Destination=\"https://sp.example.com/acs\""));
    }

    #[test]
    fn test_attribute_values_escaped() {
        let mut i = input();
        i.attributes = vec![("note".into(), "a<b&c".into())];
        let built = build_assertion(&i, Utc::now());
        assert!(built.xml.contains("a&lt;b&amp;c"));
        assert!(!built.xml.contains("a<b&c"));
    }
}
