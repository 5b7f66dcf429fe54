//! Storage seams used by the chat engine.

use async_trait::async_trait;

use crate::db::{Database, Message, MessageRepository, NewMessage, RoomRepository, UserRepository};
use crate::Result;

/// Durable, ordered storage of room messages.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persist a message, assigning its id and timestamp.
    async fn save(&self, message: NewMessage) -> Result<Message>;

    /// Most recent messages of a room, newest first.
    async fn recent(&self, room_id: &str, limit: u32) -> Result<Vec<Message>>;
}

/// Room membership and identity bookkeeping.
#[async_trait]
pub trait MembershipStore: Send + Sync + 'static {
    /// Whether a user participates in a room.
    async fn is_participant(&self, room_id: &str, user_id: &str) -> Result<bool>;

    /// Record a verified identity if it is not known yet.
    async fn ensure_user(&self, user_id: &str, username: &str) -> Result<()>;
}

/// SQLite-backed implementation of both stores.
#[derive(Debug, Clone)]
pub struct SqlChatStore {
    db: Database,
}

impl SqlChatStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl MessageStore for SqlChatStore {
    async fn save(&self, message: NewMessage) -> Result<Message> {
        MessageRepository::new(self.db.pool()).create(&message).await
    }

    async fn recent(&self, room_id: &str, limit: u32) -> Result<Vec<Message>> {
        MessageRepository::new(self.db.pool())
            .list_recent(room_id, limit)
            .await
    }
}

#[async_trait]
impl MembershipStore for SqlChatStore {
    async fn is_participant(&self, room_id: &str, user_id: &str) -> Result<bool> {
        RoomRepository::new(self.db.pool())
            .is_participant(room_id, user_id)
            .await
    }

    async fn ensure_user(&self, user_id: &str, username: &str) -> Result<()> {
        UserRepository::new(self.db.pool())
            .ensure(user_id, username)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sql_store_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let store = SqlChatStore::new(db.clone());

        store.ensure_user("alice-id", "alice").await.unwrap();
        let room = RoomRepository::new(db.pool())
            .create("", &["alice-id"])
            .await
            .unwrap();

        assert!(store.is_participant(&room.id, "alice-id").await.unwrap());
        assert!(!store.is_participant(&room.id, "bob-id").await.unwrap());

        let saved = store
            .save(NewMessage::new(&room.id, "alice", "hello"))
            .await
            .unwrap();
        let recent = store.recent(&room.id, 10).await.unwrap();
        assert_eq!(recent, vec![saved]);
    }
}
