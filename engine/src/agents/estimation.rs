use async_trait::async_trait;
use sdk::errors::EngineError;
use std::sync::Arc;
use tracing::debug;

use super::format_history;
use crate::graph::{HandlerOutput, HandlerRequest, NodeTag, ToolHandler};
use crate::llm::{ChatClient, ChatMessage};
use crate::search::{format_snippets, Search, DEFAULT_LIMIT};
use crate::stream::EventSink;

const ESTIMATOR_PROMPT: &str = r#"You are a software project cost estimator. From the requirement analysis, work out the project cost and quote:

1. Total project cost
2. Work-day breakdown by phase (design, development, testing, deployment)
3. Suggested team and resource allocation
4. A price range: minimum, recommended and maximum

Reply in markdown. Do not wrap the answer in a code block."#;

/// Prices a project from its requirement breakdown
pub struct EstimationHandler {
    client: Arc<dyn ChatClient>,
    search: Arc<dyn Search>,
    temperature: f32,
}

impl EstimationHandler {
    pub fn new(client: Arc<dyn ChatClient>, search: Arc<dyn Search>, temperature: f32) -> Self {
        Self {
            client,
            search,
            temperature,
        }
    }
}

#[async_trait]
impl ToolHandler for EstimationHandler {
    async fn invoke(
        &self,
        request: HandlerRequest<'_>,
        sink: &EventSink,
    ) -> Result<HandlerOutput, EngineError> {
        // A requirement breakdown from earlier in the run is a better basis
        // than the raw message.
        let basis = request
            .context
            .latest(NodeTag::Requirement)
            .unwrap_or(request.message);

        let (knowledge, fresh) = match request.context.knowledge.as_deref() {
            Some(known) => (known.to_string(), false),
            None => {
                let snippets = self.search.search(request.input, DEFAULT_LIMIT).await?;
                (format_snippets(&snippets), !snippets.is_empty())
            }
        };
        debug!(reused_knowledge = !fresh, "Estimating");

        let prompt = format!(
            "Requirement:\n{}\n\nConversation history:\n{}\n\nKnowledge base:\n{}\n",
            basis,
            format_history(request.history),
            knowledge
        );
        let messages = [ChatMessage::system(ESTIMATOR_PROMPT), ChatMessage::user(prompt)];

        let estimate = self
            .client
            .stream_chat(&messages, self.temperature, sink)
            .await?;

        let output = HandlerOutput::text(estimate);
        Ok(if fresh {
            output.with_knowledge(knowledge)
        } else {
            output
        })
    }
}
