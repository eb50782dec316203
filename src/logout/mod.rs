//! Single logout: message building/parsing and the multi-hop chain driver.

pub mod builder;
pub mod orchestrator;
pub mod parser;

pub use orchestrator::{LogoutOrchestrator, LogoutStep};
pub use parser::{ParsedLogoutRequest, ParsedLogoutResponse};
