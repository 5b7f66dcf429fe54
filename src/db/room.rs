//! Room repository.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{RelayError, Result};

/// Room entity.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Room {
    /// Room ID (UUID v4 for rooms created through the API).
    pub id: String,
    /// Room name, empty for direct chats.
    pub name: String,
    /// Creation timestamp.
    pub created_at: String,
}

/// A room participant as listed with its room.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Participant {
    /// User ID.
    pub id: String,
    /// Display name.
    pub username: String,
}

/// Repository for rooms and their participants.
pub struct RoomRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RoomRepository<'a> {
    /// Create a new RoomRepository with the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a room with the given participants.
    ///
    /// Participants must already exist as users. Duplicate IDs are stored once.
    pub async fn create(&self, name: &str, participants: &[&str]) -> Result<Room> {
        let id = Uuid::new_v4().to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RelayError::Database(e.to_string()))?;

        sqlx::query("INSERT INTO rooms (id, name) VALUES (?, ?)")
            .bind(&id)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| RelayError::Database(e.to_string()))?;

        for user_id in participants {
            sqlx::query(
                "INSERT INTO room_participants (room_id, user_id) VALUES (?, ?)
                 ON CONFLICT(room_id, user_id) DO NOTHING",
            )
            .bind(&id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| RelayError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RelayError::Database(e.to_string()))?;

        self.get_by_id(&id)
            .await?
            .ok_or_else(|| RelayError::NotFound("room".to_string()))
    }

    /// Get a room by ID.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Room>> {
        let result =
            sqlx::query_as::<_, Room>("SELECT id, name, created_at FROM rooms WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool)
                .await
                .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(result)
    }

    /// List the rooms a user participates in, oldest first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Room>> {
        let rooms = sqlx::query_as::<_, Room>(
            "SELECT r.id, r.name, r.created_at
             FROM rooms r
             JOIN room_participants p ON p.room_id = r.id
             WHERE p.user_id = ?
             ORDER BY r.created_at, r.rowid",
        )
        .bind(user_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(rooms)
    }

    /// List the participants of a room in the order they joined.
    pub async fn participants(&self, room_id: &str) -> Result<Vec<Participant>> {
        let participants = sqlx::query_as::<_, Participant>(
            "SELECT u.id, u.username
             FROM room_participants p
             JOIN users u ON u.id = p.user_id
             WHERE p.room_id = ?
             ORDER BY p.rowid",
        )
        .bind(room_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(participants)
    }

    /// Check whether a user participates in a room.
    pub async fn is_participant(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM room_participants WHERE room_id = ? AND user_id = ?)",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_one(self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(exists.0)
    }
}
