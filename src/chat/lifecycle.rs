//! Handshake and teardown of one client connection.
//!
//! ```text
//! Connecting -> Authenticating -> Authorizing -> Active -> Closing -> Closed
//!                     |                |
//!                     +----------------+--> Closing (1008 / 1011)
//! ```
//!
//! Once a connection is registered, a [`RegistrationGuard`] owns the
//! registration. It is released explicitly on the normal path and from `Drop`
//! when the task is cancelled or panics, so the registry forgets the
//! connection exactly once on every exit.

use std::fmt;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;

use super::ingress::{InboundFrame, IngressEnd, IngressPipeline};
use super::registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame};
use super::ChatRelay;

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Authorizing,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authorizing => "authorizing",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why the server closed (or let go of) a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed or the transport ended.
    ClientClosed,
    /// Missing or invalid token, or not a participant of the room.
    PolicyViolation,
    /// Membership lookup or registration failed.
    InternalError,
    /// The process is shutting down.
    GoingAway,
}

impl CloseReason {
    /// WebSocket close code, if the server sends a close frame.
    pub fn code(&self) -> Option<u16> {
        match self {
            CloseReason::ClientClosed => None,
            CloseReason::PolicyViolation => Some(1008),
            CloseReason::InternalError => Some(1011),
            CloseReason::GoingAway => Some(1001),
        }
    }

    /// Close frame reason text.
    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "",
            CloseReason::PolicyViolation => "policy violation",
            CloseReason::InternalError => "internal error",
            CloseReason::GoingAway => "server shutting down",
        }
    }

    /// The close frame to queue, if any.
    pub fn to_frame(&self) -> Option<OutboundFrame> {
        self.code().map(|code| OutboundFrame::Close {
            code,
            reason: self.reason().to_string(),
        })
    }
}

/// Owns a registration and releases it exactly once.
pub struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    room_id: String,
    connection_id: Uuid,
    armed: bool,
}

impl std::fmt::Debug for RegistrationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationGuard")
            .field("room_id", &self.room_id)
            .field("connection_id", &self.connection_id)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl RegistrationGuard {
    /// Register `connection` and return the guard owning the registration.
    ///
    /// The guard exists before the wait for the room's subscription, so a
    /// task cancelled during that wait still unregisters.
    pub async fn register(
        registry: Arc<ConnectionRegistry>,
        room_id: &str,
        connection: ConnectionHandle,
    ) -> crate::Result<Self> {
        let connection_id = connection.id();
        let status = registry.insert(room_id, connection).await?;
        let mut guard = Self {
            registry,
            room_id: room_id.to_string(),
            connection_id,
            armed: true,
        };

        let subscribed = guard
            .registry
            .await_subscription(room_id, connection_id, status)
            .await;
        match subscribed {
            Ok(()) => Ok(guard),
            Err(e) => {
                // Already unregistered by the failed wait.
                guard.armed = false;
                Err(e)
            }
        }
    }

    /// Unregister now.
    pub async fn release(mut self) -> bool {
        self.armed = false;
        self.registry
            .unregister(&self.room_id, self.connection_id)
            .await
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        let registry = self.registry.clone();
        let room_id = std::mem::take(&mut self.room_id);
        let connection_id = self.connection_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    registry.unregister(&room_id, connection_id).await;
                });
            }
            Err(_) => warn!(%room_id, %connection_id, "No runtime to unregister connection"),
        }
    }
}

/// Drives one connection through its states.
pub struct ConnectionLifecycle {
    relay: Arc<ChatRelay>,
    room_id: String,
    connection_id: Uuid,
    state: ConnectionState,
}

impl ConnectionLifecycle {
    /// Start a lifecycle for an accepted upgrade.
    pub fn new(relay: Arc<ChatRelay>, room_id: impl Into<String>) -> Self {
        let lifecycle = Self {
            relay,
            room_id: room_id.into(),
            connection_id: Uuid::new_v4(),
            state: ConnectionState::Connecting,
        };
        debug!(
            connection_id = %lifecycle.connection_id,
            room_id = %lifecycle.room_id,
            state = %lifecycle.state,
            "Connection accepted"
        );
        lifecycle
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(
            connection_id = %self.connection_id,
            room_id = %self.room_id,
            from = %self.state,
            to = %next,
            "Connection state"
        );
        self.state = next;
    }

    /// Authenticate and authorize.
    pub async fn handshake(&mut self, token: Option<&str>) -> Result<Identity, CloseReason> {
        self.transition(ConnectionState::Authenticating);
        let token = token.filter(|t| !t.is_empty()).ok_or_else(|| {
            debug!(connection_id = %self.connection_id, "Missing token");
            CloseReason::PolicyViolation
        })?;
        let identity = self.relay.verifier().verify(token).map_err(|e| {
            debug!(connection_id = %self.connection_id, error = %e, "Token rejected");
            CloseReason::PolicyViolation
        })?;

        self.transition(ConnectionState::Authorizing);
        match self
            .relay
            .members()
            .is_participant(&self.room_id, &identity.user_id)
            .await
        {
            Ok(true) => Ok(identity),
            Ok(false) => {
                debug!(
                    connection_id = %self.connection_id,
                    user_id = %identity.user_id,
                    "Not a participant of the room"
                );
                Err(CloseReason::PolicyViolation)
            }
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "Membership lookup failed");
                Err(CloseReason::InternalError)
            }
        }
    }

    /// Run the connection to completion.
    ///
    /// `outbound` feeds the socket writer; the close frame, if any, is the last
    /// thing queued on it.
    pub async fn run<S>(
        mut self,
        token: Option<String>,
        inbound: &mut S,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> CloseReason
    where
        S: Stream<Item = InboundFrame> + Unpin,
    {
        let reason = match self.handshake(token.as_deref()).await {
            Ok(identity) => self.activate(identity, inbound, outbound.clone()).await,
            Err(reason) => reason,
        };

        self.transition(ConnectionState::Closing);
        if let Some(frame) = reason.to_frame() {
            let _ = outbound.send(frame);
        }
        self.transition(ConnectionState::Closed);
        reason
    }

    async fn activate<S>(
        &mut self,
        identity: Identity,
        inbound: &mut S,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> CloseReason
    where
        S: Stream<Item = InboundFrame> + Unpin,
    {
        if let Err(e) = self
            .relay
            .members()
            .ensure_user(&identity.user_id, &identity.username)
            .await
        {
            warn!(connection_id = %self.connection_id, error = %e, "Failed to record user");
            return CloseReason::InternalError;
        }

        let connection = ConnectionHandle::with_id(self.connection_id, identity.clone(), outbound);
        let guard = match RegistrationGuard::register(
            self.relay.registry().clone(),
            &self.room_id,
            connection.clone(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "Registration failed");
                return CloseReason::InternalError;
            }
        };

        self.transition(ConnectionState::Active);
        info!(
            connection_id = %self.connection_id,
            room_id = %self.room_id,
            user = %identity.username,
            "Client joined room"
        );

        let publish_order = self
            .relay
            .registry()
            .publish_order(&self.room_id)
            .await
            .unwrap_or_default();
        let pipeline = IngressPipeline::new(
            &self.room_id,
            &identity.username,
            self.relay.messages().clone(),
            self.relay.broker().clone(),
            self.relay.config().max_message_length,
        )
        .with_publish_order(publish_order);
        let end = pipeline
            .run(inbound, &connection, self.relay.shutdown_token())
            .await;

        guard.release().await;
        info!(
            connection_id = %self.connection_id,
            room_id = %self.room_id,
            "Client left room"
        );

        match end {
            IngressEnd::ClientClosed => CloseReason::ClientClosed,
            IngressEnd::Shutdown => CloseReason::GoingAway,
        }
    }
}
