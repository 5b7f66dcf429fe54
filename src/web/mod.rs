//! Web module for the relay.
//!
//! Serves the WebSocket chat endpoint and a small REST API for room
//! management and message history.

pub mod dto;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod server;
pub mod ws;

pub use error::ApiError;
pub use handlers::AppState;
pub use router::{create_health_router, create_router};
pub use server::WebServer;
