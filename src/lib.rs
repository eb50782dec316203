//! Identity-provider federation broker.
//!
//! Brokers logins between end users and registered relying parties:
//! - Assurance-level session state with elevate-only factor tracking
//! - A login-flow decision engine (password, MFA, terms, activation,
//!   password change, claims selection)
//! - Token issuance for SAML 2.0, OIDC authorization-code and WS-Federation
//!   parties, with signed and optionally encrypted assertions
//! - Multi-hop single logout driven off the session's party map

pub mod assurance;
pub mod audit;
pub mod config;
pub mod directory;
pub mod error;
pub mod error_response;
pub mod flow;
pub mod logout;
pub mod party;
pub mod protocol;
pub mod session;
pub mod token;
pub mod xml;

pub use assurance::AssuranceLevel;
pub use audit::{AuditAction, AuditEvent, AuditSink, MemoryAuditSink};
pub use config::IdpConfig;
pub use error::{IdpError, IdpResult, StatusKind};
pub use error_response::{ErrorDisposition, ErrorResponder};
pub use flow::{FlowContext, FlowEngine, FlowStep};
pub use logout::{LogoutOrchestrator, LogoutStep};
pub use party::{PartyRegistry, Protocol, RelyingParty};
pub use protocol::{DeliveryInstruction, LoginRequest};
pub use session::{InMemorySessionStore, SessionState, SessionStore};
pub use token::{SigningCredentials, TokenIssuer};
