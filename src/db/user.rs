//! Users known to the relay.
//!
//! Users are never registered explicitly. A row is created the first time a
//! verified identity reaches the relay, keyed by the token subject.

use sqlx::SqlitePool;

use crate::{RelayError, Result};

/// User entity.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    /// Token subject.
    pub id: String,
    /// Display name.
    pub username: String,
    /// First time the identity was seen.
    pub created_at: String,
}

/// Repository for user operations.
pub struct UserRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UserRepository<'a> {
    /// Create a new UserRepository with the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the user if it does not exist yet.
    ///
    /// An existing row is left untouched, including its username.
    pub async fn ensure(&self, id: &str, username: &str) -> Result<User> {
        sqlx::query("INSERT INTO users (id, username) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(id)
            .bind(username)
            .execute(self.pool)
            .await
            .map_err(|e| RelayError::Database(e.to_string()))?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| RelayError::NotFound("user".to_string()))
    }

    /// Get a user by ID.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<User>> {
        let result = sqlx::query_as::<_, User>(
            "SELECT id, username, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;

        Ok(result)
    }

    /// Check whether a user exists.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?)")
            .bind(id)
            .fetch_one(self.pool)
            .await
            .map_err(|e| RelayError::Database(e.to_string()))?;
        Ok(exists.0)
    }

    /// Count users.
    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(self.pool)
            .await
            .map_err(|e| RelayError::Database(e.to_string()))?;
        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    async fn setup_db() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_ensure_creates_user() {
        let db = setup_db().await;
        let repo = UserRepository::new(db.pool());

        let user = repo.ensure("sub-1", "alice").await.unwrap();
        assert_eq!(user.id, "sub-1");
        assert_eq!(user.username, "alice");
        assert!(!user.created_at.is_empty());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let db = setup_db().await;
        let repo = UserRepository::new(db.pool());

        repo.ensure("sub-1", "alice").await.unwrap();
        let again = repo.ensure("sub-1", "alice-renamed").await.unwrap();

        assert_eq!(again.username, "alice");
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_and_exists() {
        let db = setup_db().await;
        let repo = UserRepository::new(db.pool());

        assert!(!repo.exists("sub-1").await.unwrap());
        assert!(repo.get_by_id("sub-1").await.unwrap().is_none());

        repo.ensure("sub-1", "alice").await.unwrap();
        assert!(repo.exists("sub-1").await.unwrap());
        assert_eq!(
            repo.get_by_id("sub-1").await.unwrap().unwrap().username,
            "alice"
        );
    }
}
