//! Test helpers for integration tests.
//!
//! Provides token minting, relay construction, a bound server and a small
//! WebSocket client for end-to-end tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chatrelay::broker::{Broker, MemoryBroker};
use chatrelay::chat::{BridgeSettings, ChatRelay, RoomState, SqlChatStore};
use chatrelay::config::{ChatConfig, Config};
use chatrelay::db::{RoomRepository, UserRepository};
use chatrelay::profile::ProfileClient;
use chatrelay::web::{AppState, WebServer};
use chatrelay::{Database, TokenVerifier};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared secret every test relay verifies tokens with.
pub const TEST_SECRET: &str = "test-secret-key-for-testing-only";

/// Mint an HS256 token for a user, valid for an hour.
pub fn token(user_id: &str, username: &str) -> String {
    let claims = json!({
        "sub": user_id,
        "preferred_username": username,
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Build a relay over the given broker and database.
pub fn create_relay(broker: Arc<dyn Broker>, db: &Database) -> Arc<ChatRelay> {
    ChatRelay::new(
        broker,
        Arc::new(SqlChatStore::new(db.clone())),
        TokenVerifier::hs256(TEST_SECRET),
        ChatConfig::default(),
        BridgeSettings::default(),
    )
}

/// Build the application state for a relay.
pub fn create_app_state(db: &Database, relay: Arc<ChatRelay>) -> AppState {
    AppState::new(db.clone(), relay, ProfileClient::disabled())
}

/// Start a web server on an ephemeral port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;

    WebServer::new(&config, state)
        .unwrap()
        .run_with_addr()
        .await
        .unwrap()
}

/// A relay "process": its own registry and server, sharing broker and database.
pub struct TestRelay {
    pub relay: Arc<ChatRelay>,
    pub addr: SocketAddr,
}

impl TestRelay {
    pub async fn start(broker: Arc<dyn Broker>, db: &Database) -> Self {
        let relay = create_relay(broker, db);
        let addr = spawn_server(create_app_state(db, relay.clone())).await;
        Self { relay, addr }
    }

    pub async fn start_in_memory(db: &Database) -> Self {
        Self::start(Arc::new(MemoryBroker::default()), db).await
    }

    pub fn ws_url(&self, room_id: &str, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws/chat/{}?token={}", self.addr, room_id, token),
            None => format!("ws://{}/ws/chat/{}", self.addr, room_id),
        }
    }

    /// Connect to a room with a valid token for the user.
    pub async fn connect_as(&self, room_id: &str, user_id: &str, username: &str) -> WsClient {
        WsClient::connect(&self.ws_url(room_id, Some(&token(user_id, username)))).await
    }

    /// Wait until the room has `count` local connections and a live subscription.
    pub async fn wait_for_connections(&self, room_id: &str, count: usize) {
        let registry = self.relay.registry();
        timeout(DEFAULT_TIMEOUT, async {
            loop {
                if registry.connection_count(room_id).await == count
                    && (count == 0 || registry.room_state(room_id).await == Some(RoomState::Healthy))
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("room {room_id} never reached {count} connections"));
    }
}

/// Create users and a room joining them; returns the room ID.
pub async fn seed_room(db: &Database, users: &[(&str, &str)]) -> String {
    let user_repo = UserRepository::new(db.pool());
    for (id, username) in users {
        user_repo.ensure(id, username).await.unwrap();
    }
    let ids: Vec<&str> = users.iter().map(|(id, _)| *id).collect();
    RoomRepository::new(db.pool())
        .create("", &ids)
        .await
        .unwrap()
        .id
}

/// Test WebSocket client.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(url: &str) -> Self {
        let (stream, _) = connect_async(url).await.expect("WebSocket connect failed");
        Self { stream }
    }

    pub async fn send_text(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// Next JSON frame from the server.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let msg = timeout(DEFAULT_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("WebSocket error");
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(Ok(msg))) = timeout(wait, self.stream.next()).await {
            panic!("expected no frame, got {msg:?}");
        }
    }

    /// Wait for the server's close frame.
    pub async fn recv_close(&mut self) -> Option<CloseFrame<'static>> {
        loop {
            let next = timeout(DEFAULT_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for close");
            match next {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(other)) => panic!("expected close, got {other:?}"),
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
