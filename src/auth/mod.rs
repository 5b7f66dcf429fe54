//! Authentication module for the chat relay.
//!
//! Identities come from externally issued tokens; this module verifies them.

mod token;

pub use token::{Claims, Identity, TokenVerifier};
