//! Response DTOs for the REST API.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::Identity;
use crate::db::Message;

/// Result of creating a chat.
#[derive(Debug, Serialize)]
pub struct ChatCreatedResponse {
    pub message: String,
    pub chat_id: String,
}

impl ChatCreatedResponse {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            message: "Chat created".to_string(),
            chat_id: chat_id.into(),
        }
    }
}

/// A room the caller participates in.
#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub id: String,
    pub name: String,
    pub participants: Vec<ParticipantResponse>,
}

/// A room participant, decorated with their profile picture.
#[derive(Debug, Serialize)]
pub struct ParticipantResponse {
    pub id: String,
    pub username: String,
    /// `null` when the profile service had nothing (or failed).
    pub picture: Option<String>,
}

/// A stored chat message.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            sender: message.sender,
            content: message.content,
            timestamp: message.timestamp,
        }
    }
}

/// The authenticated caller.
#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub id: String,
    pub username: String,
    pub created_at: String,
}

impl MeResponse {
    pub fn new(identity: &Identity, created_at: impl Into<String>) -> Self {
        Self {
            id: identity.user_id.clone(),
            username: identity.username.clone(),
            created_at: created_at.into(),
        }
    }
}
