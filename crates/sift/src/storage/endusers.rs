//! End-user activity tracking
//!
//! A tiny relational table behind the admin listing: who has talked to the
//! agent and when they were last active.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::types::EndUser;

/// End-user persistence port
#[async_trait]
pub trait EndUserStore: Send + Sync {
    /// Create the user on first sight, refresh `last_active` otherwise
    async fn upsert_user(&self, identifier: &str) -> Result<()>;

    /// All known users, most recently active first
    async fn list_users(&self) -> Result<Vec<EndUser>>;
}

/// SQLite implementation
pub struct SqliteEndUserStore {
    pool: SqlitePool,
}

impl SqliteEndUserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EndUserStore for SqliteEndUserStore {
    async fn upsert_user(&self, identifier: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO end_users (user_identifier, last_active, created_at)
             VALUES (?1, ?2, ?2)
             ON CONFLICT(user_identifier) DO UPDATE SET last_active = ?2",
        )
        .bind(identifier)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<EndUser>> {
        let rows = sqlx::query(
            "SELECT id, user_identifier, last_active, created_at
             FROM end_users ORDER BY last_active DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| EndUser {
                id: row.get("id"),
                user_identifier: row.get("user_identifier"),
                last_active: row.get::<DateTime<Utc>, _>("last_active"),
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
                session_count: 0,
                ltm_count: 0,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::persistence::init_schema;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_upsert_creates_then_refreshes() {
        let store = SqliteEndUserStore::new(test_pool().await);
        store.upsert_user("alice").await.unwrap();
        store.upsert_user("alice").await.unwrap();
        store.upsert_user("bob").await.unwrap();

        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 2);
        let names: Vec<_> = users.iter().map(|u| u.user_identifier.as_str()).collect();
        assert!(names.contains(&"alice"));
        assert!(names.contains(&"bob"));
    }
}
