//! Shared fixtures for integration tests: signing key material, relying
//! party profiles, identities, and a fully assembled broker.
#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder};
use std::collections::HashMap;
use std::sync::Arc;

use idp_broker::assurance::AssuranceLevel;
use idp_broker::audit::MemoryAuditSink;
use idp_broker::config::IdpConfig;
use idp_broker::directory::{
    Identity, InMemoryIdentityDirectory, InMemoryMfaDirectory, MfaDevice, PasswordPolicy,
    StaticPasswordPolicy,
};
use idp_broker::flow::FlowEngine;
use idp_broker::logout::LogoutOrchestrator;
use idp_broker::party::{
    Binding, Endpoint, MfaPolicy, PartyRegistry, Protocol, RelyingParty, StaticMetadataSource,
};
use idp_broker::session::InMemorySessionStore;
use idp_broker::token::{AuthorizationCodeService, SigningCredentials, TokenIssuer};

/// Self-signed RSA-2048 signing credentials, generated per test run.
pub fn test_credentials() -> SigningCredentials {
    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "broker-test").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();

    let cert_pem = String::from_utf8(builder.build().to_pem().unwrap()).unwrap();
    let key_pem = String::from_utf8(pkey.private_key_to_pem_pkcs8().unwrap()).unwrap();
    SigningCredentials::from_pem(&cert_pem, &key_pem).unwrap()
}

/// SAML relying party with POST endpoints under its entity id.
pub fn saml_party(entity_id: &str) -> RelyingParty {
    RelyingParty {
        entity_id: entity_id.to_string(),
        name: entity_id.to_string(),
        protocol: Protocol::Saml2,
        enabled: true,
        assertion_endpoints: vec![Endpoint {
            binding: Binding::Post,
            url: format!("{entity_id}/acs"),
        }],
        logout_endpoints: vec![Endpoint {
            binding: Binding::Post,
            url: format!("{entity_id}/slo"),
        }],
        certificates: vec![],
        validate_signatures: false,
        encrypt_assertions: false,
        mfa_policy: MfaPolicy::default(),
        skip_mfa_on_trusted_network: false,
        required_level: None,
        prefer_eid: false,
        self_service: false,
        claims_selectable: false,
        required_claims: vec![],
        name_id_format: "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent".to_string(),
        released_claims: vec!["email".to_string(), "name".to_string()],
    }
}

pub fn oidc_party(client_id: &str, redirect_uri: &str) -> RelyingParty {
    let mut party = saml_party(client_id);
    party.protocol = Protocol::Oidc;
    party.assertion_endpoints = vec![Endpoint {
        binding: Binding::Redirect,
        url: redirect_uri.to_string(),
    }];
    party.logout_endpoints = vec![];
    party
}

pub fn wsfed_party(realm: &str, reply_url: &str) -> RelyingParty {
    let mut party = saml_party(realm);
    party.protocol = Protocol::WsFed;
    party.assertion_endpoints = vec![Endpoint {
        binding: Binding::Post,
        url: reply_url.to_string(),
    }];
    party.logout_endpoints = vec![];
    party
}

/// Unlocked, activated identity with a recent password.
pub fn standard_identity(subject_id: &str) -> Identity {
    let mut attributes = HashMap::new();
    attributes.insert("email".to_string(), format!("{subject_id}@example.com"));
    attributes.insert("name".to_string(), "Test Person".to_string());
    Identity {
        subject_id: subject_id.to_string(),
        name: "Test Person".to_string(),
        max_assurance: AssuranceLevel::Substantial,
        locked: false,
        locked_by_self: false,
        needs_activation: false,
        approved_terms: true,
        has_password: true,
        force_change_password: false,
        password_changed_at: Some(Utc::now() - Duration::days(10)),
        attributes,
    }
}

pub fn unlocked_device(device_id: &str, level: AssuranceLevel) -> MfaDevice {
    MfaDevice {
        device_id: device_id.to_string(),
        name: device_id.to_string(),
        level,
        locked: false,
        primary: false,
    }
}

/// A fully assembled broker over in-memory dependencies.
pub struct TestBroker {
    pub config: IdpConfig,
    pub credentials: SigningCredentials,
    pub identities: Arc<InMemoryIdentityDirectory>,
    pub mfa: Arc<InMemoryMfaDirectory>,
    pub registry: Arc<PartyRegistry>,
    pub store: Arc<InMemorySessionStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub codes: Arc<AuthorizationCodeService>,
    pub engine: FlowEngine,
    pub issuer: TokenIssuer,
    pub logout: LogoutOrchestrator,
}

pub fn broker(parties: Vec<RelyingParty>) -> TestBroker {
    let config = IdpConfig {
        session_secret: "integration-test-secret".to_string(),
        ..IdpConfig::default()
    };
    let credentials = test_credentials();
    let identities = Arc::new(InMemoryIdentityDirectory::new());
    let mfa = Arc::new(InMemoryMfaDirectory::new());
    let registry = Arc::new(PartyRegistry::new(
        Arc::new(StaticMetadataSource::new(parties)),
        config.metadata_refresh(),
    ));
    let store = Arc::new(InMemorySessionStore::default());
    let audit = Arc::new(MemoryAuditSink::new());
    let codes = Arc::new(AuthorizationCodeService::new());

    let engine = FlowEngine::new(
        identities.clone(),
        mfa.clone(),
        Arc::new(StaticPasswordPolicy(PasswordPolicy::default())),
        audit.clone(),
        config.clone(),
    );
    let issuer = TokenIssuer::new(
        config.clone(),
        credentials.clone(),
        codes.clone(),
        audit.clone(),
    );
    let logout = LogoutOrchestrator::new(
        config.clone(),
        credentials.clone(),
        store.clone(),
        registry.clone(),
        audit.clone(),
    );

    TestBroker {
        config,
        credentials,
        identities,
        mfa,
        registry,
        store,
        audit,
        codes,
        engine,
        issuer,
        logout,
    }
}

/// A well-formed AuthnRequest from the given party, issued now.
pub fn authn_request_xml(request_id: &str, issuer: &str, acs_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="{request_id}"
    Version="2.0"
    IssueInstant="{}"
    AssertionConsumerServiceURL="{acs_url}"
    ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST">
    <saml:Issuer>{issuer}</saml:Issuer>
</samlp:AuthnRequest>"#,
        Utc::now().to_rfc3339()
    )
}

/// Decode the SAMLResponse field out of a POST delivery.
pub fn decode_post_field(fields: &[(String, String)], name: &str) -> String {
    let (_, encoded) = fields
        .iter()
        .find(|(k, _)| k == name)
        .unwrap_or_else(|| panic!("missing {name} field"));
    String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap()
}
