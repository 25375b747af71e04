//! Model-backed routing
//!
//! The reply is streamed through the run's sink so any prose the model
//! writes ahead of its decision reaches the client live; the decision
//! object itself is suppressed downstream by the payload filter.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::format_history;
use crate::graph::{
    parse_classification, ClassificationResult, ClassifierService, ClassifyError,
    ClassifyRequest,
};
use crate::llm::{ChatClient, ChatMessage};
use crate::stream::EventSink;

const ROUTER_PROMPT: &str = r#"You are a customer service assistant for a software development company.

1. When the user asks a general question, answer it directly from what you know.
2. Otherwise route the question to the node that handles it, passing along the key information from the user's message.
3. After each node returns, review the steps completed so far and the results returned, then decide the next node. Once every needed node has run, combine their results in the order they were called and give the final answer.
4. Do not call a node that has already been called.

Nodes:
- requirement: the user asks about or describes project requirements, features or technical implementation
- estimation: the user asks about a quote, cost, schedule or resourcing
- company: the user asks about the company, its team, past projects or service process
- __end__: every needed node has run; summarize and finish

Reply with a single JSON object:
- next_node: requirement, estimation, company or __end__
- inputs: the key information to hand to the node
- output: the final answer when finishing, otherwise empty
- is_final: true when finishing, otherwise false

Routing example:
{"next_node": "estimation", "inputs": "the user's question", "output": "", "is_final": false}

Answer example:
{"next_node": "__end__", "inputs": "the user's question", "output": "the answer", "is_final": true}

Reply with the JSON object only."#;

/// Classifier that asks a chat model for the next step
pub struct LlmClassifier {
    client: Arc<dyn ChatClient>,
    temperature: f32,
}

impl LlmClassifier {
    pub fn new(client: Arc<dyn ChatClient>, temperature: f32) -> Self {
        Self {
            client,
            temperature,
        }
    }

    fn prompt(request: &ClassifyRequest<'_>) -> String {
        let used = serde_json::to_string(request.tool_responses).unwrap_or_else(|_| "[]".into());
        format!(
            "User message: {}\n\nConversation history:\n{}\n\nNodes already called:\n{}\n",
            request.message,
            format_history(request.history),
            used
        )
    }
}

#[async_trait]
impl ClassifierService for LlmClassifier {
    async fn classify(
        &self,
        request: ClassifyRequest<'_>,
        sink: &EventSink,
    ) -> Result<ClassificationResult, ClassifyError> {
        debug!(
            model = self.client.model(),
            history = request.history.len(),
            invoked = request.invoked_nodes.len(),
            "Classifying"
        );

        let messages = [
            ChatMessage::system(ROUTER_PROMPT),
            ChatMessage::user(Self::prompt(&request)),
        ];
        let reply = self
            .client
            .stream_chat(&messages, self.temperature, sink)
            .await
            .map_err(|e| ClassifyError::Service(e.into()))?;

        Ok(parse_classification(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedChat;
    use crate::graph::{NodeTag, ToolResponse};
    use crate::stream::{self, StreamEvent};
    use sdk::errors::EngineError;
    use sdk::types::Turn;

    fn request<'a>(
        history: &'a [Turn],
        responses: &'a [ToolResponse],
        invoked: &'a [NodeTag],
    ) -> ClassifyRequest<'a> {
        ClassifyRequest {
            message: "How much would an app cost?",
            history,
            invoked_nodes: invoked,
            tool_responses: responses,
        }
    }

    #[tokio::test]
    async fn test_classify_streams_and_parses() {
        let chat = Arc::new(ScriptedChat::new(vec![
            r#"{"next_node": "estimation", "inputs": "app cost", "is_final": false}"#,
        ]));
        let classifier = LlmClassifier::new(chat.clone(), 0.1);
        let (sink, mut rx) = stream::channel();

        let responses = vec![ToolResponse {
            node: NodeTag::Requirement,
            result: "modules".into(),
        }];
        let history = vec![Turn::user("hi"), Turn::system("hello")];
        let decision = classifier
            .classify(request(&history, &responses, &[NodeTag::Requirement]), &sink)
            .await
            .unwrap();
        drop(sink);

        assert_eq!(decision.next_node(), NodeTag::Estimation);
        assert_eq!(decision.extracted_input(), "app cost");

        let prompt = chat.prompts().pop().unwrap();
        assert!(prompt.contains("User- hi\nAssistant- hello"));
        assert!(prompt.contains(r#"[{"node":"requirement","result":"modules"}]"#));

        assert!(matches!(rx.recv().await, Some(StreamEvent::TokenDelta { .. })));
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_malformed() {
        let chat = Arc::new(ScriptedChat::new(vec!["Let me think about that"]));
        let classifier = LlmClassifier::new(chat, 0.1);
        let (sink, _rx) = stream::channel();

        let err = classifier
            .classify(request(&[], &[], &[]), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_provider_failure_is_service_error() {
        let chat = Arc::new(ScriptedChat::failing());
        let classifier = LlmClassifier::new(chat, 0.1);
        let (sink, _rx) = stream::channel();

        let err = classifier
            .classify(request(&[], &[], &[]), &sink)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Service(EngineError::LLMProvider(_))
        ));
    }
}
