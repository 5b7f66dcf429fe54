//! Router configuration for the REST API and the WebSocket endpoint.

use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::auth::TokenVerifier;

use super::handlers::{create_chat, list_chats, list_messages, me, AppState};
use super::middleware::{create_cors_layer, inject_verifier};
use super::ws::chat_ws_handler;

/// Create the main router.
pub fn create_router(
    app_state: Arc<AppState>,
    verifier: Arc<TokenVerifier>,
    cors_origins: &[String],
) -> Router {
    let auth_routes = Router::new().route("/me", get(me));

    let chat_routes = Router::new()
        .route("/chats", get(list_chats).post(create_chat))
        .route("/chats/:room_id/messages", get(list_messages));

    let api_routes = Router::new()
        .nest("/auth", auth_routes)
        .nest("/chat", chat_routes);

    // The WebSocket endpoint authenticates from its query string itself.
    let ws_routes = Router::new().route("/ws/chat/:room_id", get(chat_ws_handler));

    Router::new()
        .nest("/api", api_routes)
        .merge(ws_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(create_cors_layer(cors_origins))
                .layer(middleware::from_fn(move |req, next| {
                    let verifier = verifier.clone();
                    inject_verifier(verifier, req, next)
                })),
        )
        .with_state(app_state)
}

/// Create a health check router.
pub fn create_health_router() -> Router {
    Router::new().route("/health", get(health_check))
}

/// Health check handler.
async fn health_check() -> &'static str {
    "OK"
}
