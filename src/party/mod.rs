//! Relying-party configuration and metadata registry.

pub mod registry;

pub use registry::{MetadataSource, PartyRegistry, StaticMetadataSource};

use serde::{Deserialize, Serialize};

use crate::assurance::AssuranceLevel;

/// Token dialect a relying party speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Saml2,
    Oidc,
    WsFed,
}

/// How a SAML message is carried to the party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    Post,
    Redirect,
}

/// A protocol endpoint published in party metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub binding: Binding,
    pub url: String,
}

/// When the party demands a second factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaPolicy {
    /// Follow whatever level the login request asks for.
    #[default]
    RequestDriven,
    /// Always step up to at least the given level.
    Always(AssuranceLevel),
}

/// Live configuration for one relying party, refreshed from its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelyingParty {
    pub entity_id: String,
    pub name: String,
    pub protocol: Protocol,
    pub enabled: bool,

    /// Where login responses are delivered.
    pub assertion_endpoints: Vec<Endpoint>,
    /// Where logout messages are delivered. May be empty for parties that
    /// never participate in single logout.
    pub logout_endpoints: Vec<Endpoint>,

    /// Signature-verification certificates, base64 DER. Multiple entries
    /// support party key rollover.
    pub certificates: Vec<String>,
    /// Require signatures on inbound requests from this party.
    pub validate_signatures: bool,
    /// Encrypt assertions to this party's certificate.
    pub encrypt_assertions: bool,

    pub mfa_policy: MfaPolicy,
    /// Waive an `Always` MFA policy for requests arriving from a trusted
    /// network.
    pub skip_mfa_on_trusted_network: bool,
    /// Floor on the assurance level this party will accept.
    pub required_level: Option<AssuranceLevel>,
    /// Prefer external eID over password for primary authentication.
    pub prefer_eid: bool,
    /// This party is the broker's own self-service portal.
    pub self_service: bool,
    /// Party lets the user choose which optional claims to release.
    pub claims_selectable: bool,
    /// Claims the identity must carry to log in here at all.
    pub required_claims: Vec<String>,
    /// NameID format to put in issued subjects.
    pub name_id_format: String,
    /// Claim names released to this party, in release order.
    pub released_claims: Vec<String>,
}

impl RelyingParty {
    /// Logout endpoint preference: POST first, Redirect as fallback.
    #[must_use]
    pub fn logout_endpoint(&self) -> Option<&Endpoint> {
        self.logout_endpoints
            .iter()
            .find(|e| e.binding == Binding::Post)
            .or_else(|| {
                self.logout_endpoints
                    .iter()
                    .find(|e| e.binding == Binding::Redirect)
            })
    }

    /// First assertion endpoint for the given binding, else any.
    #[must_use]
    pub fn assertion_endpoint(&self, preferred: Binding) -> Option<&Endpoint> {
        self.assertion_endpoints
            .iter()
            .find(|e| e.binding == preferred)
            .or_else(|| self.assertion_endpoints.first())
    }

    /// Level the login must reach: the stricter of the party floor and what
    /// the request asked for.
    #[must_use]
    pub fn required_assurance_level(
        &self,
        request: &crate::protocol::LoginRequest,
    ) -> Option<AssuranceLevel> {
        match (self.required_level, request.requested_level) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// MFA floor this party imposes regardless of what the request asked
    /// for. Trusted-network requests are exempt when the party waives them.
    #[must_use]
    pub fn mfa_floor(&self, trusted_network: bool) -> Option<AssuranceLevel> {
        match self.mfa_policy {
            MfaPolicy::RequestDriven => None,
            MfaPolicy::Always(_) if trusted_network && self.skip_mfa_on_trusted_network => None,
            MfaPolicy::Always(floor) => Some(floor),
        }
    }

    /// Check party-specific access conditions against the identity.
    pub fn meets_requirements(&self, identity: &crate::directory::Identity) -> Result<(), String> {
        for claim in &self.required_claims {
            if !identity.attributes.contains_key(claim) {
                return Err(format!("missing required claim: {claim}"));
            }
        }
        Ok(())
    }

    /// Attribute values released to this party, in configured order.
    #[must_use]
    pub fn attributes_for(
        &self,
        identity: &crate::directory::Identity,
    ) -> Vec<(String, String)> {
        self.released_claims
            .iter()
            .filter_map(|claim| {
                identity
                    .attributes
                    .get(claim)
                    .map(|value| (claim.clone(), value.clone()))
            })
            .collect()
    }
}
