//! Message log repository.
//!
//! Messages are append-only. The id is the SQLite rowid of an AUTOINCREMENT
//! column, so ids only ever grow and are never reused.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{RelayError, Result};

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Message {
    /// Assigned at write time.
    pub id: i64,
    /// Room the message belongs to.
    pub room_id: String,
    /// Display name of the sender.
    pub sender: String,
    /// Message text.
    pub content: String,
    /// Assigned at write time.
    pub timestamp: DateTime<Utc>,
}

/// A message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: String,
    pub sender: String,
    pub content: String,
}

impl NewMessage {
    /// Create a new message.
    pub fn new(
        room_id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            sender: sender.into(),
            content: content.into(),
        }
    }
}

/// Repository for the message log.
pub struct MessageRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MessageRepository<'a> {
    /// Create a new MessageRepository with the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a message, assigning its id and timestamp.
    pub async fn create(&self, message: &NewMessage) -> Result<Message> {
        let timestamp = Utc::now();
        let result = sqlx::query(
            "INSERT INTO messages (room_id, sender, content, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(&message.room_id)
        .bind(&message.sender)
        .bind(&message.content)
        .bind(timestamp)
        .execute(self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(Message {
            id: result.last_insert_rowid(),
            room_id: message.room_id.clone(),
            sender: message.sender.clone(),
            content: message.content.clone(),
            timestamp,
        })
    }

    /// List the most recent messages of a room, newest first.
    pub async fn list_recent(&self, room_id: &str, limit: u32) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT id, room_id, sender, content, timestamp
             FROM messages
             WHERE room_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(room_id)
        .bind(i64::from(limit))
        .fetch_all(self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RoomRepository, UserRepository};
    use crate::Database;

    async fn setup() -> (Database, String) {
        let db = Database::open_in_memory().await.unwrap();
        UserRepository::new(db.pool())
            .ensure("alice-id", "alice")
            .await
            .unwrap();
        let room = RoomRepository::new(db.pool())
            .create("", &["alice-id"])
            .await
            .unwrap();
        (db, room.id)
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let (db, room_id) = setup().await;
        let repo = MessageRepository::new(db.pool());

        let first = repo
            .create(&NewMessage::new(&room_id, "alice", "one"))
            .await
            .unwrap();
        let second = repo
            .create(&NewMessage::new(&room_id, "alice", "two"))
            .await
            .unwrap();

        assert!(second.id > first.id);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(repo.list_recent(&room_id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_recent_round_trips_timestamp() {
        let (db, room_id) = setup().await;
        let repo = MessageRepository::new(db.pool());

        let created = repo
            .create(&NewMessage::new(&room_id, "alice", "hello"))
            .await
            .unwrap();
        let loaded = repo.list_recent(&room_id, 1).await.unwrap();

        assert_eq!(loaded, vec![created]);
    }

    #[tokio::test]
    async fn test_list_recent_newest_first_with_limit() {
        let (db, room_id) = setup().await;
        let repo = MessageRepository::new(db.pool());

        for i in 0..5 {
            repo.create(&NewMessage::new(&room_id, "alice", format!("m{i}")))
                .await
                .unwrap();
        }

        let recent = repo.list_recent(&room_id, 3).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn test_list_recent_empty_room() {
        let (db, _) = setup().await;
        let repo = MessageRepository::new(db.pool());
        assert!(repo.list_recent("other", 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_in_unknown_room_fails() {
        let (db, _) = setup().await;
        let repo = MessageRepository::new(db.pool());

        let result = repo.create(&NewMessage::new("missing", "alice", "x")).await;
        assert!(matches!(result, Err(RelayError::Database(_))));
    }
}
