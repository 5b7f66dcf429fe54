//! Middleware for the REST API.

pub mod auth;
pub mod cors;

pub use auth::{inject_verifier, AuthUser};
pub use cors::create_cors_layer;
