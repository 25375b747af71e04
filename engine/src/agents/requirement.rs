use async_trait::async_trait;
use sdk::errors::EngineError;
use std::sync::Arc;
use tracing::{debug, warn};

use super::format_history;
use crate::graph::{HandlerOutput, HandlerRequest, ToolHandler};
use crate::llm::{ChatClient, ChatMessage};
use crate::search::{format_snippets, Search, DEFAULT_LIMIT};
use crate::stream::EventSink;

const ANALYZER_PROMPT: &str = r#"You are a software project analyst. Break the user's requirement down into a markdown requirements document with these sections:

# <Project name> Requirements

## Module Overview
A table per client (mobile, web, admin) with columns: Module | Feature | Detail | Description

## Analysis
### Tech Stack
A table with columns: Layer | Choice (frontend, backend, database, operations)

### Complexity
A bullet list of the hard parts: heavy interaction, security, data consistency, extensibility.

Reply in markdown only. Do not wrap the document in a code block."#;

/// Turns a requirement description into a module and tech stack breakdown
pub struct RequirementHandler {
    client: Arc<dyn ChatClient>,
    search: Arc<dyn Search>,
    temperature: f32,
}

impl RequirementHandler {
    pub fn new(client: Arc<dyn ChatClient>, search: Arc<dyn Search>, temperature: f32) -> Self {
        Self {
            client,
            search,
            temperature,
        }
    }
}

#[async_trait]
impl ToolHandler for RequirementHandler {
    async fn invoke(
        &self,
        request: HandlerRequest<'_>,
        sink: &EventSink,
    ) -> Result<HandlerOutput, EngineError> {
        let snippets = self.search.search(request.input, DEFAULT_LIMIT).await?;
        if snippets.is_empty() {
            warn!(query = request.input, "No knowledge found for requirement");
        }
        let knowledge = format_snippets(&snippets);

        let prompt = format!(
            "Requirement:\n{}\n\nKey points:\n{}\n\nConversation history:\n{}\n\nKnowledge base:\n{}\n",
            request.message,
            request.input,
            format_history(request.history),
            knowledge
        );
        let messages = [ChatMessage::system(ANALYZER_PROMPT), ChatMessage::user(prompt)];

        let analysis = self
            .client
            .stream_chat(&messages, self.temperature, sink)
            .await?;
        debug!(chars = analysis.len(), "Requirement analysis complete");

        let output = HandlerOutput::text(analysis);
        Ok(if snippets.is_empty() {
            output
        } else {
            output.with_knowledge(knowledge)
        })
    }
}
