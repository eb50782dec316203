//! WS-Federation sign-in response envelope.

use chrono::{DateTime, Duration, Utc};

use crate::xml::xml_escape;

/// Wrap a signed SAML assertion in a RequestSecurityTokenResponse for
/// WS-Federation relying parties.
#[must_use]
pub fn wrap_in_rstr(
    assertion_xml: &str,
    party_entity_id: &str,
    now: DateTime<Utc>,
) -> String {
    let created = format_instant(now);
    let expires = format_instant(now + Duration::hours(1));

    let mut xml = String::new();
    xml.push_str("<t:RequestSecurityTokenResponse xmlns:t=\"http://schemas.xmlsoap.org/ws/2005/02/trust\">");
    xml.push_str("<t:Lifetime><wsu:Created xmlns:wsu=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd\">");
    xml.push_str(&created);
    xml.push_str("</wsu:Created><wsu:Expires xmlns:wsu=\"http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd\">");
    xml.push_str(&expires);
    xml.push_str("</wsu:Expires></t:Lifetime>");
    xml.push_str("<wsp:AppliesTo xmlns:wsp=\"http://schemas.xmlsoap.org/ws/2004/09/policy\"><wsa:EndpointReference xmlns:wsa=\"http://www.w3.org/2005/08/addressing\"><wsa:Address>");
    xml.push_str(&xml_escape(party_entity_id));
    xml.push_str("</wsa:Address></wsa:EndpointReference></wsp:AppliesTo>");
    xml.push_str("<t:RequestedSecurityToken>");
    xml.push_str(assertion_xml);
    xml.push_str("</t:RequestedSecurityToken>");
    xml.push_str("<t:TokenType>urn:oasis:names:tc:SAML:2.0:assertion</t:TokenType>");
    xml.push_str("<t:RequestType>http://schemas.xmlsoap.org/ws/2005/02/trust/Issue</t:RequestType>");
    xml.push_str("<t:KeyType>http://schemas.xmlsoap.org/ws/2005/05/identity/NoProofKey</t:KeyType>");
    xml.push_str("</t:RequestSecurityTokenResponse>");
    xml
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rstr_carries_assertion_and_scope() {
        let rstr = wrap_in_rstr("<saml:Assertion ID=\"_a\"/>", "urn:legacy:app", Utc::now());
        assert!(rstr.contains("<t:RequestedSecurityToken><saml:Assertion ID=\"_a\"/></t:RequestedSecurityToken>"));
        assert!(rstr.contains("<wsa:Address>urn:legacy:app</wsa:Address>"));
        assert!(rstr.contains("NoProofKey"));
    }
}
