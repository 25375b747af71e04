/// Conversation persistence operations
///
/// All queries use parameterized queries for SQL injection prevention.
use anyhow::{Context, Result};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{Role, Turn};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::Persistence;

/// Conversation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Conversation repository for database operations
#[derive(Clone)]
pub struct ConversationRepository {
    pool: SqlitePool,
}

impl ConversationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a conversation row. Existing ids are left untouched.
    pub async fn create(&self, id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "INSERT OR IGNORE INTO conversations (id, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create conversation")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT id, created_at, updated_at FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get conversation")?;

        Ok(row.map(|r| Conversation {
            id: r.get("id"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// Append a message, creating the conversation row on first use
    pub async fn append(&self, id: &str, role: Role, content: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        sqlx::query(
            "INSERT INTO conversations (id, created_at, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert conversation")?;

        sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(role.as_str())
        .bind(content)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to insert message")?;

        tx.commit().await.context("Failed to commit message")?;

        Ok(())
    }

    /// The most recent `limit` messages in chronological order
    pub async fn history(&self, id: &str, limit: u32) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT role, content FROM (
                SELECT id, role, content FROM messages
                WHERE conversation_id = ?
                ORDER BY id DESC
                LIMIT ?
             ) ORDER BY id ASC",
        )
        .bind(id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to get conversation history")?;

        Ok(rows.iter().map(row_to_turn).collect())
    }

    pub async fn latest(&self, id: &str) -> Result<Option<Turn>> {
        let row = sqlx::query(
            "SELECT role, content FROM messages WHERE conversation_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get latest message")?;

        Ok(row.as_ref().map(row_to_turn))
    }

    /// Delete a conversation and its messages
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete conversation")?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Turn {
    let role: String = row.get("role");
    Turn {
        role: Role::from_stored(&role),
        content: row.get("content"),
    }
}

fn persistence_error(e: anyhow::Error) -> EngineError {
    EngineError::Persistence(format!("{:#}", e))
}

#[async_trait]
impl Persistence for ConversationRepository {
    async fn create_conversation(&self) -> Result<String, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create(&id).await.map_err(persistence_error)?;
        Ok(id)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), EngineError> {
        self.append(conversation_id, role, content)
            .await
            .map_err(persistence_error)
    }

    async fn get_history(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<Vec<Turn>, EngineError> {
        self.history(conversation_id, limit)
            .await
            .map_err(persistence_error)
    }

    async fn latest_message(&self, conversation_id: &str) -> Result<Option<Turn>, EngineError> {
        self.latest(conversation_id).await.map_err(persistence_error)
    }
}
