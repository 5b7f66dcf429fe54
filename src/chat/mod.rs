//! Chat module for the relay.
//!
//! This module provides the connection/room fan-out engine:
//! - [`ConnectionRegistry`]: live connections by room, local fan-out
//! - bridges from each occupied room's broker channel to the registry
//! - [`IngressPipeline`]: persist-then-publish for inbound messages
//! - [`ConnectionLifecycle`]: handshake and exactly-once teardown

mod bridge;
mod ingress;
mod lifecycle;
mod message;
mod registry;
mod store;

pub use bridge::BridgeSettings;
pub use ingress::{InboundFrame, IngressEnd, IngressError, IngressPipeline};
pub use lifecycle::{CloseReason, ConnectionLifecycle, ConnectionState, RegistrationGuard};
pub use message::{channel_name, ChatPayload, ErrorCode, RoomState, ServerFrame, CHANNEL_PREFIX};
pub use registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame};
pub use store::{MembershipStore, MessageStore, SqlChatStore};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::TokenVerifier;
use crate::broker::Broker;
use crate::config::ChatConfig;

/// Everything a connection needs, shared by all connections of a process.
pub struct ChatRelay {
    registry: Arc<ConnectionRegistry>,
    broker: Arc<dyn Broker>,
    messages: Arc<dyn MessageStore>,
    members: Arc<dyn MembershipStore>,
    verifier: TokenVerifier,
    config: ChatConfig,
    shutdown: CancellationToken,
}

impl ChatRelay {
    /// Create the relay context.
    pub fn new<S>(
        broker: Arc<dyn Broker>,
        store: Arc<S>,
        verifier: TokenVerifier,
        config: ChatConfig,
        bridge_settings: BridgeSettings,
    ) -> Arc<Self>
    where
        S: MessageStore + MembershipStore,
    {
        Arc::new(Self {
            registry: ConnectionRegistry::new(broker.clone(), bridge_settings),
            broker,
            messages: store.clone(),
            members: store,
            verifier,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    pub fn members(&self) -> &Arc<dyn MembershipStore> {
        &self.members
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Cancelled when the process shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// End every ingress loop and stop all bridges.
    pub async fn shutdown(&self) {
        info!("Shutting down chat relay");
        self.shutdown.cancel();
        self.registry.shutdown().await;
    }
}
