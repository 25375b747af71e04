/// Database module for SQLite persistence
///
/// Durable conversation history lives here. The [`Persistence`] trait is
/// what the rest of the engine depends on; [`ConversationRepository`] backs
/// it with SQLite and [`InMemoryPersistence`] backs it with a map for tests
/// and ephemeral sessions.
use anyhow::{Context, Result};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{Role, Turn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub mod conversations;

pub use conversations::ConversationRepository;

/// Durable conversation history
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Create a new conversation and return its id
    async fn create_conversation(&self) -> Result<String, EngineError>;

    /// Append one message. The conversation is created if it does not exist.
    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), EngineError>;

    /// The most recent `limit` messages, oldest first
    async fn get_history(&self, conversation_id: &str, limit: u32)
        -> Result<Vec<Turn>, EngineError>;

    /// The newest message, if any
    async fn latest_message(&self, conversation_id: &str) -> Result<Option<Turn>, EngineError>;
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    ///
    /// Creates the file if missing, enables WAL mode and foreign keys, and
    /// runs migrations. SQLite replays a leftover WAL on open, so an unclean
    /// shutdown needs no extra recovery step.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations. Every statement is idempotent.
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush the WAL to disk
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Flush the WAL and close all connections
    pub async fn close(self) -> Result<()> {
        info!("Closing database connection");

        self.flush_wal().await?;
        self.pool.close().await;

        info!("Database connection closed");
        Ok(())
    }

    /// Create a conversation repository
    pub fn conversations(&self) -> ConversationRepository {
        ConversationRepository::new(self.pool.clone())
    }
}

/// Map-backed [`Persistence`] with no durability
#[derive(Default)]
pub struct InMemoryPersistence {
    conversations: RwLock<HashMap<String, Vec<Turn>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn create_conversation(&self) -> Result<String, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conversations
            .write()
            .await
            .insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), EngineError> {
        self.conversations
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .push(Turn {
                role,
                content: content.to_string(),
            });
        Ok(())
    }

    async fn get_history(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<Vec<Turn>, EngineError> {
        let conversations = self.conversations.read().await;
        let Some(turns) = conversations.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let skip = turns.len().saturating_sub(limit as usize);
        Ok(turns[skip..].to_vec())
    }

    async fn latest_message(&self, conversation_id: &str) -> Result<Option<Turn>, EngineError> {
        Ok(self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .and_then(|turns| turns.last().cloned()))
    }
}
