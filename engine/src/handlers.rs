//! Command handlers for CLI operations
//!
//! - serve: Run the HTTP server and the memory eviction sweeper
//! - ask: Run one turn in the foreground
//! - history: Show a conversation's stored messages

use anyhow::{Context, Result};
use async_trait::async_trait;
use sdk::errors::{EngineError, EnvoyErrorExt};
use sdk::types::{ClientMessage, MessageStatus};
use serde_json::json;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::db::{Database, InMemoryPersistence, Persistence};
use crate::llm::openai::OpenAiClient;
use crate::search::NullSearch;
use crate::service::{spawn_eviction_sweeper, ChatService};
use crate::stream::{ConnectionRegistry, Transport};

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Prints client messages as they are pushed
pub struct StdoutTransport {
    format: OutputFormat,
}

impl StdoutTransport {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Text rendering of one message, or `None` when it prints nothing
    pub fn render(&self, message: &ClientMessage) -> Option<String> {
        if self.format == OutputFormat::Json {
            return Some(format!("{}\n", message.to_json()));
        }

        match message.status {
            MessageStatus::Started => None,
            MessageStatus::Streaming => Some(message.message.clone()),
            MessageStatus::Processing => Some(format!("{}\n", message.message)),
            MessageStatus::Tool => Some(format!(
                "\n[{}]\n{}\n",
                message.tool_name.as_deref().unwrap_or("tool"),
                message.message
            )),
            MessageStatus::Completed => Some(format!("\n{}\n", message.message)),
            MessageStatus::Error => Some(format!("\nError: {}\n", message.message)),
        }
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn push(&self, message: &ClientMessage) -> Result<(), EngineError> {
        let Some(text) = self.render(message) else {
            return Ok(());
        };
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

fn chat_client(config: &Config) -> Result<Arc<OpenAiClient>> {
    let client = OpenAiClient::from_config(&config.llm).with_context(|| {
        format!(
            "Failed to create LLM client (is {} set?)",
            config.llm.api_key_env
        )
    })?;
    Ok(Arc::new(client))
}

/// Run the server until Ctrl-C
pub async fn handle_serve(host: Option<String>, port: Option<u16>, config: &Config) -> Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;

    let service = Arc::new(ChatService::from_config(
        config,
        chat_client(config)?,
        Arc::new(NullSearch),
        Arc::new(database.conversations()),
        Arc::new(ConnectionRegistry::new()),
    ));

    let sweeper = spawn_eviction_sweeper(Arc::clone(service.memory()), config.sweep_interval());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    };
    let served = crate::server::serve(addr, service, shutdown).await;

    sweeper.abort();
    database.close().await.context("Failed to close database")?;
    served.context("Server failed")
}

/// Run one turn and print its messages
pub async fn handle_ask(
    message: String,
    conversation: Option<String>,
    ephemeral: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = if ephemeral {
        None
    } else {
        Some(
            Database::new(&config.database_path())
                .await
                .context("Failed to open database")?,
        )
    };
    let persistence: Arc<dyn Persistence> = match &database {
        Some(db) => Arc::new(db.conversations()),
        None => Arc::new(InMemoryPersistence::new()),
    };

    let conversation_id = match conversation {
        Some(id) => id,
        None => persistence
            .create_conversation()
            .await
            .context("Failed to create conversation")?,
    };

    let registry = Arc::new(ConnectionRegistry::new());
    registry
        .subscribe(&conversation_id, Arc::new(StdoutTransport::new(format)))
        .await;

    let service = ChatService::from_config(
        config,
        chat_client(config)?,
        Arc::new(NullSearch),
        persistence,
        registry,
    );

    let result = service.run_turn(&conversation_id, &message).await;

    if let Some(db) = database {
        db.close().await.context("Failed to close database")?;
    }

    match result {
        Ok(outcome) => {
            match format {
                OutputFormat::Text => {
                    println!();
                    println!("Conversation: {}", conversation_id);
                }
                OutputFormat::Json => {
                    let output = json!({
                        "conversation_id": conversation_id,
                        "response": outcome.response,
                        "iterations": outcome.iterations,
                        "termination": format!("{:?}", outcome.termination)
                    });
                    println!("{}", serde_json::to_string(&output)?);
                }
            }
            Ok(())
        }
        Err(e) => {
            let hint = e.user_hint().to_string();
            Err(anyhow::Error::new(e).context(hint))
        }
    }
}

/// Show a conversation's stored messages
pub async fn handle_history(
    conversation_id: String,
    limit: u32,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;
    let repo = database.conversations();

    let conversation = repo.get(&conversation_id).await?;
    let messages = repo
        .history(&conversation_id, limit)
        .await
        .context("Failed to fetch conversation history")?;

    match format {
        OutputFormat::Text => {
            let Some(conversation) = conversation else {
                println!("Conversation {} not found", conversation_id);
                database.close().await?;
                return Ok(());
            };

            let created = chrono::DateTime::from_timestamp(conversation.created_at, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            println!("Conversation {} (created {})", conversation.id, created);
            println!();

            for turn in &messages {
                println!("{}: {}", turn.role, turn.content);
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "conversation_id": conversation_id,
                "messages": messages,
                "count": messages.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_rendering() {
        let transport = StdoutTransport::new(OutputFormat::Text);

        let started = ClientMessage::new("c1", MessageStatus::Started, "hi");
        assert_eq!(transport.render(&started), None);

        let streaming = ClientMessage::new("c1", MessageStatus::Streaming, "Hel");
        assert_eq!(transport.render(&streaming).as_deref(), Some("Hel"));

        let tool = ClientMessage::tool("c1", "company", "About us");
        assert_eq!(
            transport.render(&tool).as_deref(),
            Some("\n[company]\nAbout us\n")
        );
    }

    #[test]
    fn test_json_rendering() {
        let transport = StdoutTransport::new(OutputFormat::Json);
        let message = ClientMessage::new("c1", MessageStatus::Completed, "done");

        let line = transport.render(&message).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["conversation_id"], "c1");
    }
}
