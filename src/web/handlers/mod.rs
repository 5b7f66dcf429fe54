//! REST API handlers.

pub mod auth;
pub mod chat;

pub use auth::*;
pub use chat::*;

use std::sync::Arc;

use crate::chat::ChatRelay;
use crate::profile::ProfileClient;
use crate::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database for room and history queries.
    pub db: Database,
    /// The relay engine; also serves the WebSocket endpoint.
    pub relay: Arc<ChatRelay>,
    /// Profile service used to decorate participants.
    pub profiles: ProfileClient,
}

impl AppState {
    /// Create a new application state.
    pub fn new(db: Database, relay: Arc<ChatRelay>, profiles: ProfileClient) -> Self {
        Self {
            db,
            relay,
            profiles,
        }
    }
}
