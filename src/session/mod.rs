//! Browser session state and persistence.

pub mod state;
pub mod store;

pub use state::{
    FlowFlags, IdentityRef, IpCheck, LevelRead, PartySession, PendingLogout, SessionState,
};
pub use store::{InMemorySessionStore, SessionStore};
