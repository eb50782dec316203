//! Login-flow decision engine and its sub-flows.

pub mod engine;
pub mod mfa;
pub mod password;

pub use engine::{FlowContext, FlowEngine, FlowStep};
pub use mfa::MfaStep;
pub use password::PasswordStatus;
