//! WebSocket relay end-to-end tests.
//!
//! Real sockets against bound servers: handshake rejection, local fan-out,
//! fan-out across relay processes sharing one broker, and teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chatrelay::broker::MemoryBroker;
use chatrelay::db::MessageRepository;
use chatrelay::Database;
use common::{seed_room, token, TestRelay, WsClient};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

async fn setup() -> (Database, TestRelay, String) {
    let db = Database::open_in_memory().await.unwrap();
    let relay = TestRelay::start_in_memory(&db).await;
    let room_id = seed_room(&db, &[("alice-id", "alice"), ("bob-id", "bob")]).await;
    (db, relay, room_id)
}

async fn fetch_history(url: &str) -> serde_json::Value {
    reqwest::Client::new()
        .get(url)
        .bearer_auth(token("bob-id", "bob"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_missing_token_closes_with_policy_violation() {
    let (_db, relay, room_id) = setup().await;

    let mut client = WsClient::connect(&relay.ws_url(&room_id, None)).await;
    let frame = client.recv_close().await.expect("close frame");
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "policy violation");
}

#[tokio::test]
async fn test_invalid_token_closes_with_policy_violation() {
    let (_db, relay, room_id) = setup().await;

    let mut client = WsClient::connect(&relay.ws_url(&room_id, Some("not-a-jwt"))).await;
    let frame = client.recv_close().await.expect("close frame");
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(relay.relay.registry().total_connections().await, 0);
}

#[tokio::test]
async fn test_non_participant_closes_with_policy_violation() {
    let (_db, relay, room_id) = setup().await;

    let mallory = token("mallory-id", "mallory");
    let mut client = WsClient::connect(&relay.ws_url(&room_id, Some(&mallory))).await;
    let frame = client.recv_close().await.expect("close frame");
    assert_eq!(frame.code, CloseCode::Policy);
    assert!(!relay.relay.registry().has_subscription(&room_id).await);
}

#[tokio::test]
async fn test_message_reaches_every_connection_in_room() {
    let (db, relay, room_id) = setup().await;

    let mut alice = relay.connect_as(&room_id, "alice-id", "alice").await;
    let mut bob = relay.connect_as(&room_id, "bob-id", "bob").await;
    relay.wait_for_connections(&room_id, 2).await;

    alice.send_text("hello bob").await;

    for client in [&mut alice, &mut bob] {
        let frame = client.recv_json().await;
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["sender"], "alice");
        assert_eq!(frame["content"], "hello bob");
        assert!(frame["id"].as_i64().unwrap() > 0);
        assert!(frame["timestamp"].is_string());
    }

    let stored = MessageRepository::new(db.pool())
        .list_recent(&room_id, 10)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender, "alice");
    assert_eq!(stored[0].content, "hello bob");
}

#[tokio::test]
async fn test_messages_arrive_in_publish_order() {
    let (_db, relay, room_id) = setup().await;

    let mut alice = relay.connect_as(&room_id, "alice-id", "alice").await;
    let mut bob = relay.connect_as(&room_id, "bob-id", "bob").await;
    relay.wait_for_connections(&room_id, 2).await;

    for i in 0..10 {
        alice.send_text(&format!("message {i}")).await;
    }

    let mut last_id = 0;
    for i in 0..10 {
        let frame = bob.recv_json().await;
        assert_eq!(frame["content"], format!("message {i}"));
        let id = frame["id"].as_i64().unwrap();
        assert!(id > last_id);
        last_id = id;
    }
}

#[tokio::test]
async fn test_other_rooms_do_not_receive() {
    let (db, relay, room_id) = setup().await;
    let other_room = seed_room(&db, &[("alice-id", "alice"), ("carol-id", "carol")]).await;

    let mut alice = relay.connect_as(&room_id, "alice-id", "alice").await;
    let mut carol = relay.connect_as(&other_room, "carol-id", "carol").await;
    relay.wait_for_connections(&room_id, 1).await;
    relay.wait_for_connections(&other_room, 1).await;

    alice.send_text("only for room one").await;
    assert_eq!(alice.recv_json().await["content"], "only for room one");
    carol.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_empty_message_rejected_to_sender_only() {
    let (db, relay, room_id) = setup().await;

    let mut alice = relay.connect_as(&room_id, "alice-id", "alice").await;
    let mut bob = relay.connect_as(&room_id, "bob-id", "bob").await;
    relay.wait_for_connections(&room_id, 2).await;

    alice.send_text("   ").await;

    let frame = alice.recv_json().await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "empty_message");
    bob.expect_silence(Duration::from_millis(200)).await;

    let stored = MessageRepository::new(db.pool())
        .list_recent(&room_id, 10)
        .await
        .unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn test_fan_out_across_relays_sharing_a_broker() {
    let db = Database::open_in_memory().await.unwrap();
    let broker = Arc::new(MemoryBroker::default());
    let relay_a = TestRelay::start(broker.clone(), &db).await;
    let relay_b = TestRelay::start(broker.clone(), &db).await;
    let room_id = seed_room(&db, &[("alice-id", "alice"), ("bob-id", "bob")]).await;

    let mut alice = relay_a.connect_as(&room_id, "alice-id", "alice").await;
    let mut bob = relay_b.connect_as(&room_id, "bob-id", "bob").await;
    relay_a.wait_for_connections(&room_id, 1).await;
    relay_b.wait_for_connections(&room_id, 1).await;

    // One broker subscription per relay, not per connection.
    assert_eq!(broker.subscriber_count(&chatrelay::chat::channel_name(&room_id)), 2);

    alice.send_text("across processes").await;
    bob.send_text("and back").await;

    for client in [&mut alice, &mut bob] {
        let first = client.recv_json().await;
        let second = client.recv_json().await;
        let mut contents = [
            first["content"].as_str().unwrap().to_string(),
            second["content"].as_str().unwrap().to_string(),
        ];
        contents.sort();
        assert_eq!(contents, ["across processes", "and back"]);
    }
}

#[tokio::test]
async fn test_disconnect_deregisters_and_unsubscribes() {
    let (_db, relay, room_id) = setup().await;

    let alice = relay.connect_as(&room_id, "alice-id", "alice").await;
    relay.wait_for_connections(&room_id, 1).await;
    assert!(relay.relay.registry().has_subscription(&room_id).await);

    alice.close().await;
    relay.wait_for_connections(&room_id, 0).await;

    tokio::time::timeout(common::DEFAULT_TIMEOUT, async {
        while relay.relay.registry().has_subscription(&room_id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscription was not released");
}

#[tokio::test]
async fn test_shutdown_closes_with_going_away() {
    let (_db, relay, room_id) = setup().await;

    let mut alice = relay.connect_as(&room_id, "alice-id", "alice").await;
    relay.wait_for_connections(&room_id, 1).await;

    relay.relay.shutdown().await;

    let frame = alice.recv_close().await.expect("close frame");
    assert_eq!(frame.code, CloseCode::Away);
    assert_eq!(relay.relay.registry().total_connections().await, 0);
}

#[tokio::test]
async fn test_history_survives_reconnect() {
    let (_db, relay, room_id) = setup().await;
    let connected_at = chrono::Utc::now();

    let mut alice = relay.connect_as(&room_id, "alice-id", "alice").await;
    relay.wait_for_connections(&room_id, 1).await;
    alice.send_text("hi").await;
    let echoed = alice.recv_json().await;
    alice.close().await;
    relay.wait_for_connections(&room_id, 0).await;

    let history_url = format!(
        "http://{}/api/chat/chats/{}/messages?limit=50",
        relay.addr, room_id
    );
    let history = fetch_history(&history_url).await;
    let messages = history.as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["sender"], "alice");
    assert_eq!(messages[0]["content"], "hi");
    assert_eq!(messages[0]["id"], echoed["id"]);
    let stamped: chrono::DateTime<chrono::Utc> =
        messages[0]["timestamp"].as_str().unwrap().parse().unwrap();
    assert!(stamped >= connected_at);

    // A new connection starts a fresh subscription; history keeps its ids.
    let mut alice = relay.connect_as(&room_id, "alice-id", "alice").await;
    relay.wait_for_connections(&room_id, 1).await;
    alice.send_text("again").await;
    assert_eq!(alice.recv_json().await["content"], "again");

    let history = fetch_history(&history_url).await;
    let messages = history.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "again");
    assert_eq!(messages[1]["id"], echoed["id"]);
}
