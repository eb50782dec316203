//! Protocol front door: wire codecs, request normalization, signature
//! validation.

pub mod codec;
pub mod request;
pub mod signature;

pub use codec::{DeliveryInstruction, SamlMessageKind};
pub use request::{AuthnRequestParser, LoginRequest};
pub use signature::SignatureValidator;
