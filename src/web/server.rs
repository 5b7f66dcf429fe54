//! Web server for the relay.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::{RelayError, Result};

use super::handlers::AppState;
use super::router::{create_health_router, create_router};

/// Web server for the API and the WebSocket endpoint.
pub struct WebServer {
    /// Server address.
    addr: SocketAddr,
    /// Application state.
    app_state: Arc<AppState>,
    /// Verifier for bearer tokens on REST routes.
    verifier: Arc<TokenVerifier>,
    /// CORS allowed origins.
    cors_origins: Vec<String>,
}

impl WebServer {
    /// Create a new web server.
    pub fn new(config: &Config, app_state: AppState) -> Result<Self> {
        let addr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid server address: {e}")))?;

        let verifier = Arc::new(app_state.relay.verifier().clone());

        Ok(Self {
            addr,
            app_state: Arc::new(app_state),
            verifier,
            cors_origins: config.web.cors_origins.clone(),
        })
    }

    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn router(&self) -> Router {
        create_router(
            self.app_state.clone(),
            self.verifier.clone(),
            &self.cors_origins,
        )
        .merge(create_health_router())
    }

    /// Run the web server until `shutdown` completes.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Web server listening on http://{}", local_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Web server stopped");
        Ok(())
    }

    /// Run the server and return the actual bound address.
    ///
    /// This is useful for testing when binding to port 0.
    pub async fn run_with_addr(self) -> Result<SocketAddr> {
        let router = self.router();

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Web server listening on http://{}", local_addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("Web server error: {}", e);
            }
        });

        Ok(local_addr)
    }
}
