//! End-to-end single logout: login to several parties, then walk the chain.

mod common;

use chrono::Utc;
use idp_broker::assurance::AssuranceLevel;
use idp_broker::audit::AuditAction;
use idp_broker::directory::IdentityDirectory;
use idp_broker::SessionStore;
use idp_broker::logout::LogoutStep;
use idp_broker::party::Binding;
use idp_broker::protocol::codec::{decode_post_message, detect_kind, SamlMessageKind};
use idp_broker::protocol::{AuthnRequestParser, DeliveryInstruction, SignatureValidator};
use idp_broker::session::{IdentityRef, SessionState};

use common::{authn_request_xml, broker, decode_post_field, saml_party, standard_identity};

const SP_A: &str = "https://sp-a.example.com";
const SP_B: &str = "https://sp-b.example.com";

fn peer_logout_request(issuer: &str, name_id: &str) -> String {
    format!(
        r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_peer_req" Version="2.0" IssueInstant="2026-02-21T10:00:00Z"><saml:Issuer>{issuer}</saml:Issuer><saml:NameID>{name_id}</saml:NameID></samlp:LogoutRequest>"#
    )
}

fn peer_logout_response(issuer: &str) -> String {
    format!(
        r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_peer_resp" Version="2.0" IssueInstant="2026-02-21T10:00:00Z"><saml:Issuer>{issuer}</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status></samlp:LogoutResponse>"#
    )
}

#[tokio::test]
async fn test_login_twice_then_single_logout() {
    let b = broker(vec![saml_party(SP_A), saml_party(SP_B)]);
    b.identities.insert(standard_identity("alice")).await;

    let mut session = SessionState::new();
    session.identity = Some(IdentityRef {
        subject_id: "alice".into(),
        name: "Test Person".into(),
        level: AssuranceLevel::Substantial,
    });
    session.set_password_level(Some(AssuranceLevel::Substantial), Utc::now());
    let identity = b.identities.find("alice").await.unwrap().unwrap();

    // Log in to both parties so each records a session index.
    for (i, sp) in [SP_A, SP_B].iter().enumerate() {
        let party = b.registry.find(sp).await.unwrap();
        let request = AuthnRequestParser::parse(&authn_request_xml(
            &format!("_req_{i}"),
            sp,
            &format!("{sp}/acs"),
        ))
        .unwrap();
        b.issuer
            .issue(&mut session, &party, &request, &identity)
            .await
            .unwrap();
    }
    let sp_b_index = session.party_sessions.get(SP_B).unwrap().session_index.clone();
    let session_id = session.id.clone();
    b.store.put(session).await.unwrap();

    // SP-A starts the chain; the broker turns to SP-B next.
    let step = b
        .logout
        .process_request(
            &session_id,
            &peer_logout_request(SP_A, "alice"),
            Binding::Post,
            Some("rs-1"),
        )
        .await
        .unwrap();
    let LogoutStep::NextParty { entity_id, delivery } = step else {
        panic!("expected NextParty");
    };
    assert_eq!(entity_id, SP_B);

    // The outbound LogoutRequest is signed and carries SP-B's own
    // session index.
    let DeliveryInstruction::Post { url, fields } = delivery else {
        panic!("expected POST delivery");
    };
    assert_eq!(url, format!("{SP_B}/slo"));
    let encoded = &fields.iter().find(|(k, _)| k == "SAMLRequest").unwrap().1;
    let outbound_xml = decode_post_message(encoded).unwrap();
    assert_eq!(
        detect_kind(&outbound_xml).unwrap(),
        SamlMessageKind::LogoutRequest
    );
    assert!(outbound_xml.contains(&sp_b_index));
    let cert = b.credentials.certificate_base64_der().unwrap();
    SignatureValidator::validate_enveloped(&outbound_xml, &[cert.clone()]).unwrap();

    // SP-B confirms; the chain closes back to SP-A with the relay state.
    let step = b
        .logout
        .process_response(&session_id, &peer_logout_response(SP_B), Binding::Post)
        .await
        .unwrap();
    let LogoutStep::Complete { delivery: Some(DeliveryInstruction::Post { url, fields }) } = step
    else {
        panic!("expected final POST response");
    };
    assert_eq!(url, format!("{SP_A}/slo"));
    assert!(fields.iter().any(|(k, v)| k == "RelayState" && v == "rs-1"));

    let final_xml = decode_post_field(&fields, "SAMLResponse");
    assert_eq!(
        detect_kind(&final_xml).unwrap(),
        SamlMessageKind::LogoutResponse
    );
    assert!(final_xml.contains("InResponseTo=\"_peer_req\""));
    assert!(final_xml.contains("urn:oasis:names:tc:SAML:2.0:status:Success"));
    SignatureValidator::validate_enveloped(&final_xml, &[cert]).unwrap();

    // The session is gone and the completion was audited once.
    assert!(b.store.get(&session_id).await.unwrap().is_none());
    assert_eq!(b.audit.count_of(AuditAction::LogoutCompleted).await, 1);
}
