use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::format_history;
use crate::graph::{HandlerOutput, HandlerRequest, ToolHandler};
use crate::llm::{extract_json_object, ChatClient, ChatMessage};
use crate::search::{format_snippets, sources, Search, DEFAULT_LIMIT};
use crate::stream::EventSink;

/// Answer given when the knowledge base has nothing on the question
pub const NOT_FOUND_ANSWER: &str =
    "Sorry, I couldn't find information related to your question in our knowledge base.";

/// At most this many sources and related topics are shown
const MAX_LISTED: usize = 3;

const KNOWLEDGE_PROMPT: &str = r#"You answer questions about the company: its history, team and skills, services and process, past projects, and technology.

Answer only from the knowledge base results you are given. If they do not cover the question, say so plainly; do not make anything up.

Reply with a single JSON object:
- answer: a detailed, professional answer
- sources: list of the sources used
- confidence: 0.0 to 1.0
- related_topics: optional list of related topics

Reply with the JSON object only."#;

#[derive(Debug, Default, Deserialize)]
struct KnowledgeAnswer {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    related_topics: Vec<String>,
}

/// Answers company questions from the knowledge base
pub struct CompanyHandler {
    client: Arc<dyn ChatClient>,
    search: Arc<dyn Search>,
    temperature: f32,
}

impl CompanyHandler {
    pub fn new(client: Arc<dyn ChatClient>, search: Arc<dyn Search>, temperature: f32) -> Self {
        Self {
            client,
            search,
            temperature,
        }
    }
}

#[async_trait]
impl ToolHandler for CompanyHandler {
    async fn invoke(
        &self,
        request: HandlerRequest<'_>,
        _sink: &EventSink,
    ) -> Result<HandlerOutput, EngineError> {
        let snippets = self.search.search(request.input, DEFAULT_LIMIT).await?;
        if snippets.is_empty() {
            warn!(query = request.input, "No knowledge found for company question");
            return Ok(HandlerOutput::text(NOT_FOUND_ANSWER));
        }
        let knowledge = format_snippets(&snippets);

        let prompt = format!(
            "Question:\n{}\n\nConversation history:\n{}\n\nKnowledge base:\n{}\n",
            request.input,
            format_history(request.history),
            knowledge
        );
        let messages = [ChatMessage::system(KNOWLEDGE_PROMPT), ChatMessage::user(prompt)];

        // Structured reply, so it is not streamed.
        let reply = self.client.chat(&messages, self.temperature).await?;

        let mut parsed = match extract_json_object(&reply)
            .and_then(|raw| serde_json::from_str::<KnowledgeAnswer>(raw).ok())
        {
            Some(parsed) => parsed,
            None => {
                warn!("Knowledge reply was not JSON, using it verbatim");
                KnowledgeAnswer {
                    answer: reply.trim().to_string(),
                    ..Default::default()
                }
            }
        };
        if parsed.sources.is_empty() {
            parsed.sources = sources(&snippets);
        }

        Ok(HandlerOutput::text(render(&parsed)).with_knowledge(knowledge))
    }
}

fn render(answer: &KnowledgeAnswer) -> String {
    let mut out = if answer.answer.trim().is_empty() {
        NOT_FOUND_ANSWER.to_string()
    } else {
        answer.answer.trim().to_string()
    };

    if !answer.sources.is_empty() {
        out.push_str("\n\nSources:");
        for source in answer.sources.iter().take(MAX_LISTED) {
            out.push_str("\n- ");
            out.push_str(source);
        }
    }

    if !answer.related_topics.is_empty() {
        out.push_str("\n\nYou may also want to know:");
        for topic in answer.related_topics.iter().take(MAX_LISTED) {
            out.push_str("\n- ");
            out.push_str(topic);
        }
    }

    out
}
