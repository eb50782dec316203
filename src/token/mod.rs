//! Token issuance: SAML assertions, OIDC authorization codes, WS-Fed
//! envelopes.

pub mod assertion;
pub mod encryption;
pub mod issuer;
pub mod oidc;
pub mod signing;
pub mod wsfed;

pub use issuer::TokenIssuer;
pub use oidc::AuthorizationCodeService;
pub use signing::SigningCredentials;
