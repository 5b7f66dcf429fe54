//! Chat payloads and the frames sent to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Message;

/// Prefix of every room channel on the broker.
pub const CHANNEL_PREFIX: &str = "chat_channel:";

/// Broker channel name for a room.
pub fn channel_name(room_id: &str) -> String {
    format!("{CHANNEL_PREFIX}{room_id}")
}

/// Canonical message payload published on a room channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub id: i64,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for ChatPayload {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            sender: message.sender.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
        }
    }
}

/// Error codes reported to clients in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The message could not be stored; it was not published.
    PersistFailed,
    /// The message was stored but could not be published.
    PublishFailed,
    /// The message was empty or whitespace only.
    EmptyMessage,
    /// The message exceeded the length limit.
    MessageTooLong,
    /// The room lost its broker subscription; messages are not fanned out.
    RoomDegraded,
}

/// Fan-out health of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    /// Waiting for the first subscribe to complete.
    Starting,
    /// Subscribed; messages are fanned out.
    Healthy,
    /// Subscription lost and not yet recovered.
    Degraded,
    /// The initial subscribe failed and the bridge gave up.
    Failed,
}

/// A JSON frame sent to a client, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A chat message.
    Message(ChatPayload),
    /// Something went wrong for this client.
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
    },
    /// Room health changed.
    RoomStatus { status: RoomState },
}

impl ServerFrame {
    /// Build an error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            message_id: None,
        }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> String {
        // Serializing these plain structs cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload() -> ChatPayload {
        ChatPayload {
            id: 42,
            sender: "alice".to_string(),
            content: "hi".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name("abc"), "chat_channel:abc");
    }

    #[test]
    fn test_payload_json_shape() {
        let json: serde_json::Value = serde_json::to_value(payload()).unwrap();
        assert_eq!(json["id"], 42);
        assert_eq!(json["sender"], "alice");
        assert_eq!(json["content"], "hi");
        assert_eq!(json["timestamp"], "2024-05-01T12:30:00Z");
    }

    #[test]
    fn test_message_frame_is_tagged() {
        let json: serde_json::Value =
            serde_json::from_str(&ServerFrame::Message(payload()).to_json()).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["id"], 42);
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ServerFrame::Error {
            code: ErrorCode::PublishFailed,
            message: "broker down".to_string(),
            message_id: Some(7),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "publish_failed");
        assert_eq!(json["message_id"], 7);

        let json: serde_json::Value =
            serde_json::from_str(&ServerFrame::error(ErrorCode::EmptyMessage, "empty").to_json())
                .unwrap();
        assert!(json.get("message_id").is_none());
    }

    #[test]
    fn test_room_status_frame() {
        let frame = ServerFrame::RoomStatus {
            status: RoomState::Healthy,
        };
        assert_eq!(frame.to_json(), r#"{"type":"room_status","status":"healthy"}"#);
    }
}
