//! In-process table of live connections grouped by room.
//!
//! The registry owns local fan-out and the lifecycle of each room's
//! [`ChannelBridge`]. One mutex guards the whole room map, so membership and
//! the bridge handle of a room always change together: the first connection
//! of a room starts its bridge and the last one to leave cancels it, exactly
//! once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::broker::{Broker, BrokerError};
use crate::{RelayError, Result};

use super::bridge::{BridgeHandle, BridgeSettings, ChannelBridge};
use super::message::{ErrorCode, RoomState, ServerFrame};

/// A frame queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON text frame.
    Text(String),
    /// Reply to a client ping.
    Pong(Vec<u8>),
    /// Close the socket with this code and reason.
    Close { code: u16, reason: String },
}

/// The registry's reference to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    identity: Identity,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh connection id.
    pub fn new(identity: Identity, outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self::with_id(Uuid::new_v4(), identity, outbound)
    }

    /// Create a handle with a known connection id.
    pub fn with_id(
        id: Uuid,
        identity: Identity,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Self {
        Self {
            id,
            identity,
            outbound,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue a frame. Returns `false` if the transport is gone.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Queue a server frame as JSON text.
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        self.send(OutboundFrame::Text(frame.to_json()))
    }
}

pub(crate) fn degraded_notice() -> ServerFrame {
    ServerFrame::error(
        ErrorCode::RoomDegraded,
        "room is temporarily unable to deliver messages",
    )
}

struct RoomEntry {
    connections: HashMap<Uuid, ConnectionHandle>,
    bridge: BridgeHandle,
    publish_order: Arc<Mutex<()>>,
}

/// Live connections by room.
pub struct ConnectionRegistry {
    rooms: Mutex<HashMap<String, RoomEntry>>,
    broker: Arc<dyn Broker>,
    settings: BridgeSettings,
    shutdown: CancellationToken,
    next_bridge: AtomicU64,
    this: Weak<ConnectionRegistry>,
}

impl ConnectionRegistry {
    /// Create a registry whose bridges subscribe through `broker`.
    pub fn new(broker: Arc<dyn Broker>, settings: BridgeSettings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            rooms: Mutex::new(HashMap::new()),
            broker,
            settings,
            shutdown: CancellationToken::new(),
            next_bridge: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    /// Add a connection to a room.
    ///
    /// The first connection of a room starts the room's bridge. Registration
    /// returns once the bridge has made its first subscribe attempt, so
    /// messages published afterwards reach the new connection.
    ///
    /// With `fail_fast`, a failed initial subscribe fails the registration
    /// and the connection is removed again.
    ///
    /// A caller cancelled while this waits for the bridge leaves the
    /// connection registered. Connection tasks go through
    /// [`RegistrationGuard::register`](super::lifecycle::RegistrationGuard::register),
    /// which unregisters on cancellation.
    pub async fn register(&self, room_id: &str, connection: ConnectionHandle) -> Result<()> {
        let connection_id = connection.id();
        let status = self.insert(room_id, connection).await?;
        self.await_subscription(room_id, connection_id, status).await
    }

    /// Insert a connection under the lock and return its room's state.
    pub(crate) async fn insert(
        &self,
        room_id: &str,
        connection: ConnectionHandle,
    ) -> Result<watch::Receiver<RoomState>> {
        let connection_id = connection.id();
        let mut rooms = self.rooms.lock().await;
        let status = match rooms.get_mut(room_id) {
            Some(entry) => {
                // The bridge only announces transitions, so late joiners
                // of a degraded room are told here.
                if entry.bridge.state() == RoomState::Degraded {
                    connection.send_frame(&degraded_notice());
                }
                entry.connections.insert(connection_id, connection);
                entry.bridge.watch()
            }
            None => {
                if self.shutdown.is_cancelled() {
                    return Err(RelayError::Broker(BrokerError::Closed));
                }
                let bridge = ChannelBridge::spawn(
                    self.next_bridge.fetch_add(1, Ordering::Relaxed),
                    room_id,
                    self.broker.clone(),
                    self.this.clone(),
                    self.settings.clone(),
                    self.shutdown.child_token(),
                );
                let status = bridge.watch();
                let mut connections = HashMap::new();
                connections.insert(connection_id, connection);
                rooms.insert(
                    room_id.to_string(),
                    RoomEntry {
                        connections,
                        bridge,
                        publish_order: Arc::default(),
                    },
                );
                info!(%room_id, "Room opened");
                status
            }
        };

        debug!(%room_id, %connection_id, "Connection registered");
        Ok(status)
    }

    /// Wait for the room's first subscribe outcome.
    ///
    /// Runs without the lock; the bridge needs it to deliver. A failed room
    /// unregisters the connection again.
    pub(crate) async fn await_subscription(
        &self,
        room_id: &str,
        connection_id: Uuid,
        mut status: watch::Receiver<RoomState>,
    ) -> Result<()> {
        let state = match status.wait_for(|s| *s != RoomState::Starting).await {
            Ok(state) => *state,
            // The bridge went away (room closed under us).
            Err(_) => RoomState::Failed,
        };

        if state == RoomState::Failed {
            self.unregister(room_id, connection_id).await;
            return Err(RelayError::Broker(BrokerError::Subscribe(format!(
                "room {room_id} has no broker subscription"
            ))));
        }
        Ok(())
    }

    /// Remove a connection from a room.
    ///
    /// Cancels the room's bridge when the room becomes empty. Returns `false`
    /// when the connection was not registered.
    pub async fn unregister(&self, room_id: &str, connection_id: Uuid) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(entry) = rooms.get_mut(room_id) else {
            return false;
        };
        if entry.connections.remove(&connection_id).is_none() {
            return false;
        }
        debug!(%room_id, %connection_id, "Connection unregistered");

        if entry.connections.is_empty() {
            if let Some(entry) = rooms.remove(room_id) {
                entry.bridge.cancel();
                info!(%room_id, "Room closed");
            }
        }
        true
    }

    /// Send a frame to every local connection of a room.
    ///
    /// Returns the number of connections reached. Connections whose transport
    /// is gone are unregistered after the loop.
    pub async fn broadcast_local(&self, room_id: &str, frame: &ServerFrame) -> usize {
        self.deliver(room_id, None, frame).await
    }

    /// Fan-out used by bridges. A bridge id that no longer owns the room
    /// (the room was closed and reopened) delivers nothing.
    pub(crate) async fn deliver(
        &self,
        room_id: &str,
        bridge_id: Option<u64>,
        frame: &ServerFrame,
    ) -> usize {
        let snapshot: Vec<ConnectionHandle> = {
            let rooms = self.rooms.lock().await;
            match rooms.get(room_id) {
                Some(entry) if bridge_id.map_or(true, |id| id == entry.bridge.id()) => {
                    entry.connections.values().cloned().collect()
                }
                _ => return 0,
            }
        };
        self.send_all(room_id, &snapshot, frame).await
    }

    /// Apply a bridge state change under the lock, then fan out the frame
    /// it yields.
    ///
    /// A connection registering at the same time either sees the new state
    /// or is in the snapshot, never both, so it is told about the change
    /// once.
    pub(crate) async fn transition<F>(&self, room_id: &str, bridge_id: u64, change: F) -> usize
    where
        F: FnOnce() -> Option<ServerFrame>,
    {
        let (snapshot, frame) = {
            let rooms = self.rooms.lock().await;
            let Some(frame) = change() else {
                return 0;
            };
            match rooms.get(room_id) {
                Some(entry) if entry.bridge.id() == bridge_id => {
                    let snapshot: Vec<ConnectionHandle> =
                        entry.connections.values().cloned().collect();
                    (snapshot, frame)
                }
                _ => return 0,
            }
        };
        self.send_all(room_id, &snapshot, &frame).await
    }

    async fn send_all(
        &self,
        room_id: &str,
        snapshot: &[ConnectionHandle],
        frame: &ServerFrame,
    ) -> usize {
        let text = frame.to_json();
        let mut failed = Vec::new();
        for connection in snapshot {
            if !connection.send(OutboundFrame::Text(text.clone())) {
                failed.push(connection.id());
            }
        }

        for connection_id in &failed {
            warn!(%room_id, %connection_id, "Dropping connection with closed transport");
            self.unregister(room_id, *connection_id).await;
        }

        snapshot.len() - failed.len()
    }

    /// Lock that orders persist-then-publish across a room's connections.
    ///
    /// `None` when the room has no connections.
    pub async fn publish_order(&self, room_id: &str) -> Option<Arc<Mutex<()>>> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map(|entry| entry.publish_order.clone())
    }

    /// Number of local connections in a room.
    pub async fn connection_count(&self, room_id: &str) -> usize {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    /// Number of rooms with a running bridge.
    pub async fn active_subscriptions(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Whether a room has a running bridge.
    pub async fn has_subscription(&self, room_id: &str) -> bool {
        self.rooms.lock().await.contains_key(room_id)
    }

    /// Fan-out health of an occupied room.
    pub async fn room_state(&self, room_id: &str) -> Option<RoomState> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map(|entry| entry.bridge.state())
    }

    /// Total number of local connections.
    pub async fn total_connections(&self) -> usize {
        self.rooms
            .lock()
            .await
            .values()
            .map(|entry| entry.connections.len())
            .sum()
    }

    /// Stop every bridge and refuse new rooms.
    ///
    /// Connections stay registered until their lifecycles end.
    pub async fn shutdown(&self) {
        let rooms = self.rooms.lock().await;
        self.shutdown.cancel();
        info!(rooms = rooms.len(), "Connection registry shut down");
    }
}
