//! Broker error types
//!
//! Every terminal failure is classified as a Requester fault (invalid
//! inbound request or session state) or a Responder fault (this system
//! could not fulfil a valid request). The classification drives the SAML
//! status URI placed in signed error responses.

use thiserror::Error;

/// Result type for broker operations
pub type IdpResult<T> = Result<T, IdpError>;

/// Top-level fault classification for terminal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Requester,
    Responder,
}

impl StatusKind {
    /// SAML 2.0 top-level status code URI for this fault class.
    #[must_use]
    pub const fn status_uri(self) -> &'static str {
        match self {
            StatusKind::Requester => "urn:oasis:names:tc:SAML:2.0:status:Requester",
            StatusKind::Responder => "urn:oasis:names:tc:SAML:2.0:status:Responder",
        }
    }
}

/// Broker-wide errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdpError {
    /// Invalid or malformed inbound login request
    #[error("Invalid login request: {0}")]
    InvalidLoginRequest(String),

    /// Invalid or malformed inbound logout message
    #[error("Invalid logout message: {0}")]
    InvalidLogoutMessage(String),

    /// Inbound message could not be decoded (after the single retry)
    #[error("Message decoding failed: {0}")]
    DecodeFailed(String),

    /// Signature validation against the peer certificate failed
    #[error("Signature validation failed: {0}")]
    SignatureValidationFailed(String),

    /// Issuer does not match any registered relying party
    #[error("Unknown relying party: {0}")]
    UnknownRelyingParty(String),

    /// A flag-gated sub-flow handler was reached without its flag set
    #[error("Flow state violation: {0}")]
    FlowStateViolation(String),

    /// Passive request that cannot be satisfied from existing session state
    #[error("Passive login requested, but the user is not logged in at the required level")]
    PassiveLoginNotSatisfiable,

    /// The identity's account is locked
    #[error("The account is locked")]
    AccountLocked,

    /// The relying party demands an assurance level this broker does not issue
    #[error("Assurance level {0} is not supported")]
    UnsupportedAssuranceLevel(crate::assurance::AssuranceLevel),

    /// The identity's verified level is below what the relying party demands
    #[error("Identity assurance level too low: {0}")]
    AssuranceTooLow(String),

    /// Identity is not approved for assurance-bearing logins at all
    #[error("Identity is not approved for assurance-level logins")]
    NotEligibleForAssurance,

    /// The relying party's access conditions rejected the identity
    #[error("Login aborted, the identity does not meet the relying party's requirements: {0}")]
    RequirementsNotMet(String),

    /// No registered MFA device satisfies the required level
    #[error("No eligible MFA device at the required level")]
    NoEligibleMfaDevice,

    /// MFA device list could not be obtained from the directory
    #[error("MFA directory unavailable: {0}")]
    MfaDirectoryUnavailable(String),

    /// Relying-party metadata missing or unreachable
    #[error("Metadata unavailable for {0}")]
    MetadataUnavailable(String),

    /// No logout endpoint published in the relying party's metadata
    #[error("No logout endpoint in metadata for {0}")]
    MissingLogoutEndpoint(String),

    /// No usable certificate published in the relying party's metadata
    #[error("No {usage} certificate in metadata for {entity_id}")]
    MissingCertificate {
        entity_id: String,
        usage: &'static str,
    },

    /// Token/assertion could not be built or signed
    #[error("Token generation failed: {0}")]
    TokenGenerationFailed(String),

    /// Assertion encryption failed
    #[error("Assertion encryption failed: {0}")]
    EncryptionFailed(String),

    /// Session store failure
    #[error("Session store error: {0}")]
    SessionStore(#[from] SessionStoreError),

    /// Session not found for the browser-held token
    #[error("No session for the presented token")]
    SessionNotFound,

    /// Credential-at-rest encryption failure
    #[error("Session credential protection failed: {0}")]
    CredentialProtectionFailed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Session store errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionStoreError {
    #[error("Session storage error: {0}")]
    StorageError(String),
}

impl IdpError {
    /// Requester/Responder classification used when routing a signed error
    /// response to an identifiable relying party.
    #[must_use]
    pub const fn status(&self) -> StatusKind {
        match self {
            IdpError::InvalidLoginRequest(_)
            | IdpError::InvalidLogoutMessage(_)
            | IdpError::DecodeFailed(_)
            | IdpError::SignatureValidationFailed(_)
            | IdpError::UnknownRelyingParty(_)
            | IdpError::FlowStateViolation(_)
            | IdpError::NoEligibleMfaDevice
            | IdpError::AccountLocked
            | IdpError::SessionNotFound => StatusKind::Requester,

            IdpError::PassiveLoginNotSatisfiable
            | IdpError::UnsupportedAssuranceLevel(_)
            | IdpError::AssuranceTooLow(_)
            | IdpError::NotEligibleForAssurance
            | IdpError::RequirementsNotMet(_)
            | IdpError::MfaDirectoryUnavailable(_)
            | IdpError::MetadataUnavailable(_)
            | IdpError::MissingLogoutEndpoint(_)
            | IdpError::MissingCertificate { .. }
            | IdpError::TokenGenerationFailed(_)
            | IdpError::EncryptionFailed(_)
            | IdpError::SessionStore(_)
            | IdpError::CredentialProtectionFailed(_)
            | IdpError::InternalError(_) => StatusKind::Responder,
        }
    }

    /// Message safe to embed in an outbound error response. Internal
    /// details are logged, never disclosed.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            IdpError::SessionStore(e) => {
                tracing::error!(error = %e, "session store failure");
                "A session storage error occurred".to_string()
            }
            IdpError::TokenGenerationFailed(msg) => {
                tracing::error!(error = %msg, "token generation failed");
                "Token generation failed".to_string()
            }
            IdpError::EncryptionFailed(msg) => {
                tracing::error!(error = %msg, "assertion encryption failed");
                "Assertion encryption failed".to_string()
            }
            IdpError::CredentialProtectionFailed(msg) | IdpError::InternalError(msg) => {
                tracing::error!(error = %msg, "internal failure");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}
