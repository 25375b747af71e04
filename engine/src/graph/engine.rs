//! Graph Engine
//!
//! Drives one conversation turn through bounded classify/dispatch cycles:
//!
//! 1. Ask the classifier for a decision (one iteration)
//! 2. If the decision is final: emit the answer and stop
//! 3. Otherwise run the named handler, record its result, return to MAIN
//!
//! # Limits
//!
//! - At most `max_iterations` classify calls per turn; past that the turn
//!   ends with a degraded answer
//! - A malformed decision ends the turn with a fallback answer
//! - A handler failure aborts the turn

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::Turn;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::classifier::{ClassifierService, ClassifyError, ClassifyRequest};
use super::{route, NodeTag, RunState, ToolResponse};
use crate::config::GraphConfig;
use crate::stream::EventSink;

/// Knowledge gathered earlier in the run, handed to each handler
#[derive(Debug, Clone, Default)]
pub struct KnowledgeContext {
    /// Formatted search results collected by a previous handler
    pub knowledge: Option<String>,
    /// Tool responses recorded so far, oldest first
    pub prior: Vec<ToolResponse>,
}

impl KnowledgeContext {
    /// Most recent result recorded for `node`
    pub fn latest(&self, node: NodeTag) -> Option<&str> {
        self.prior
            .iter()
            .rev()
            .find(|r| r.node == node)
            .map(|r| r.result.as_str())
    }
}

/// Inputs to one handler invocation
#[derive(Debug, Clone, Copy)]
pub struct HandlerRequest<'a> {
    /// The user's message for this turn
    pub message: &'a str,
    /// Text the classifier extracted for this handler
    pub input: &'a str,
    pub history: &'a [Turn],
    pub context: &'a KnowledgeContext,
}

/// Result of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutput {
    pub text: String,
    /// Knowledge worth keeping for later handlers in the same run
    pub knowledge: Option<String>,
}

impl HandlerOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            knowledge: None,
        }
    }

    pub fn with_knowledge(mut self, knowledge: impl Into<String>) -> Self {
        self.knowledge = Some(knowledge.into());
        self
    }
}

/// Specialist computation behind a dispatch node
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(
        &self,
        request: HandlerRequest<'_>,
        sink: &EventSink,
    ) -> Result<HandlerOutput, EngineError>;
}

/// One handler per dispatch node
#[derive(Clone)]
pub struct HandlerSet {
    requirement: Arc<dyn ToolHandler>,
    estimation: Arc<dyn ToolHandler>,
    company: Arc<dyn ToolHandler>,
}

impl HandlerSet {
    pub fn new(
        requirement: Arc<dyn ToolHandler>,
        estimation: Arc<dyn ToolHandler>,
        company: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            requirement,
            estimation,
            company,
        }
    }

    /// Handler for a node. Control nodes have none.
    pub fn get(&self, node: NodeTag) -> Option<&Arc<dyn ToolHandler>> {
        match node {
            NodeTag::Requirement => Some(&self.requirement),
            NodeTag::Estimation => Some(&self.estimation),
            NodeTag::Company => Some(&self.company),
            NodeTag::Main | NodeTag::End => None,
        }
    }
}

/// How a run reached END
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The classifier produced a final answer
    Answered,
    /// A decision could not be parsed
    ClassificationFallback,
    /// The iteration cap was reached
    IterationLimit,
}

/// Successful end of a run
#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    pub termination: Termination,
    /// Classify calls made
    pub iterations: usize,
}

impl RunReport {
    pub fn response(&self) -> &str {
        self.state.response.as_deref().unwrap_or_default()
    }
}

/// Aborted run. The state keeps every tool response recorded before the
/// failure, for diagnostics.
#[derive(Debug)]
pub struct RunFailure {
    pub state: RunState,
    pub error: EngineError,
}

/// The classify/dispatch state machine
pub struct GraphEngine {
    classifier: Arc<dyn ClassifierService>,
    handlers: HandlerSet,
    max_iterations: usize,
    fallback_message: String,
    exhausted_message: String,
}

impl GraphEngine {
    pub fn new(
        classifier: Arc<dyn ClassifierService>,
        handlers: HandlerSet,
        config: &GraphConfig,
    ) -> Self {
        Self {
            classifier,
            handlers,
            max_iterations: config.max_iterations.max(1),
            fallback_message: config.fallback_message.clone(),
            exhausted_message: config.exhausted_message.clone(),
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Run one turn to completion.
    ///
    /// Events are written to `sink` in generation order. The run ends with a
    /// MAIN lifecycle event carrying the answer followed by END, unless it
    /// fails, in which case no final event is emitted.
    pub async fn run(
        &self,
        conversation_id: &str,
        message: &str,
        history: Vec<Turn>,
        seed: Vec<ToolResponse>,
        sink: &EventSink,
    ) -> Result<RunReport, RunFailure> {
        let mut state = RunState::new(conversation_id, message, history, seed);
        let mut iterations = 0;

        debug!(conversation_id, "Run started");

        loop {
            if iterations >= self.max_iterations {
                let limit = EngineError::IterationLimitExceeded {
                    limit: self.max_iterations,
                };
                warn!(
                    conversation_id,
                    node = %state.current_node,
                    tool_responses = state.tool_responses().len(),
                    "{}",
                    limit
                );
                let text = self.exhausted_message.clone();
                return self
                    .finish(state, text, Termination::IterationLimit, iterations, sink)
                    .await;
            }
            iterations += 1;

            let invoked = state.invoked_nodes();
            let request = ClassifyRequest {
                message: &state.message,
                history: &state.history,
                invoked_nodes: &invoked,
                tool_responses: state.tool_responses(),
            };

            let decision = match self.classifier.classify(request, sink).await {
                Ok(decision) => decision,
                Err(ClassifyError::Malformed(reason)) => {
                    warn!(
                        conversation_id,
                        node = %state.current_node,
                        iteration = iterations,
                        %reason,
                        "Classification parse error, answering with fallback"
                    );
                    let text = self.fallback_message.clone();
                    return self
                        .finish(
                            state,
                            text,
                            Termination::ClassificationFallback,
                            iterations,
                            sink,
                        )
                        .await;
                }
                Err(ClassifyError::Service(error)) => {
                    error!(
                        conversation_id,
                        node = %state.current_node,
                        error = %error,
                        "Classifier failed"
                    );
                    return Err(RunFailure { state, error });
                }
            };

            let Some(node) = route(state.current_node, &decision).filter(NodeTag::is_dispatch)
            else {
                let text = decision.output().to_string();
                return self
                    .finish(state, text, Termination::Answered, iterations, sink)
                    .await;
            };

            if state.invoked_nodes().contains(&node) {
                debug!(conversation_id, node = %node, "Dispatching to an already visited node");
            }

            state.current_node = node;
            state.last_input = decision.extracted_input().to_string();

            let output = match self.dispatch(&state, node, sink).await {
                Ok(output) => output,
                Err(error) => {
                    error!(
                        conversation_id,
                        node = %node,
                        tool_responses = state.tool_responses().len(),
                        error = %error,
                        "Tool handler failed, aborting run"
                    );
                    return Err(RunFailure { state, error });
                }
            };

            state.record(node, output.text);
            if let Some(knowledge) = output.knowledge {
                state.set_knowledge(knowledge);
            }

            let snapshot = state.tool_responses().to_vec();
            if let Err(error) = sink.lifecycle(node, "", false, snapshot).await {
                return Err(RunFailure { state, error });
            }

            state.current_node = route(node, &decision).unwrap_or(NodeTag::Main);
        }
    }

    async fn dispatch(
        &self,
        state: &RunState,
        node: NodeTag,
        sink: &EventSink,
    ) -> Result<HandlerOutput, EngineError> {
        let handler = self.handlers.get(node).ok_or_else(|| EngineError::ToolHandler {
            node: node.to_string(),
            message: "no handler for node".to_string(),
        })?;

        let context = KnowledgeContext {
            knowledge: state.knowledge().map(str::to_string),
            prior: state.tool_responses().to_vec(),
        };
        let request = HandlerRequest {
            message: &state.message,
            input: &state.last_input,
            history: &state.history,
            context: &context,
        };

        match handler.invoke(request, sink).await {
            Ok(output) => Ok(output),
            Err(e @ (EngineError::StreamClosed | EngineError::ToolHandler { .. })) => Err(e),
            Err(other) => Err(EngineError::ToolHandler {
                node: node.to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn finish(
        &self,
        mut state: RunState,
        output: String,
        termination: Termination,
        iterations: usize,
        sink: &EventSink,
    ) -> Result<RunReport, RunFailure> {
        state.response = Some(output.clone());
        state.is_final = true;

        let snapshot = state.tool_responses().to_vec();
        if let Err(error) = sink
            .lifecycle(NodeTag::Main, output, true, snapshot.clone())
            .await
        {
            return Err(RunFailure { state, error });
        }
        state.current_node = NodeTag::End;
        if let Err(error) = sink.lifecycle(NodeTag::End, "", true, snapshot).await {
            return Err(RunFailure { state, error });
        }

        info!(
            conversation_id = %state.conversation_id,
            iterations,
            termination = ?termination,
            tool_responses = state.tool_responses().len(),
            "Run finished"
        );

        Ok(RunReport {
            state,
            termination,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ClassificationResult;
    use crate::stream::{self, StreamEvent};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted(Mutex<VecDeque<Result<ClassificationResult, ClassifyError>>>);

    #[async_trait]
    impl ClassifierService for Scripted {
        async fn classify(
            &self,
            _request: ClassifyRequest<'_>,
            _sink: &EventSink,
        ) -> Result<ClassificationResult, ClassifyError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ClassificationResult::terminal("default")))
        }
    }

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn invoke(
            &self,
            request: HandlerRequest<'_>,
            _sink: &EventSink,
        ) -> Result<HandlerOutput, EngineError> {
            Ok(HandlerOutput::text(format!("echo:{}", request.input)))
        }
    }

    fn engine(script: Vec<Result<ClassificationResult, ClassifyError>>) -> GraphEngine {
        let echo: Arc<dyn ToolHandler> = Arc::new(Echo);
        GraphEngine::new(
            Arc::new(Scripted(Mutex::new(script.into()))),
            HandlerSet::new(Arc::clone(&echo), Arc::clone(&echo), echo),
            &GraphConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_then_answer() {
        let engine = engine(vec![
            Ok(ClassificationResult::dispatch(NodeTag::Company, "who").unwrap()),
            Ok(ClassificationResult::terminal("done")),
        ]);
        let (sink, mut rx) = stream::channel();

        let report = engine
            .run("c1", "hi", Vec::new(), Vec::new(), &sink)
            .await
            .unwrap();
        drop(sink);

        assert_eq!(report.response(), "done");
        assert_eq!(report.iterations, 2);
        assert_eq!(report.state.last_input, "who");
        assert_eq!(report.state.tool_responses()[0].result, "echo:who");

        let mut nodes = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::NodeLifecycle { node, .. } = event {
                nodes.push(node);
            }
        }
        assert_eq!(nodes, vec![NodeTag::Company, NodeTag::Main, NodeTag::End]);
    }

    #[tokio::test]
    async fn test_service_error_is_failure() {
        let engine = engine(vec![Err(ClassifyError::Service(EngineError::LLMProvider(
            "down".into(),
        )))]);
        let (sink, _rx) = stream::channel();

        let failure = engine
            .run("c1", "hi", Vec::new(), Vec::new(), &sink)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, EngineError::LLMProvider(_)));
        assert!(!failure.state.is_final);
    }

    #[tokio::test]
    async fn test_seed_counts_as_invoked() {
        let engine = engine(vec![Ok(ClassificationResult::terminal("ok"))]);
        let (sink, _rx) = stream::channel();
        let seed = vec![ToolResponse {
            node: NodeTag::Requirement,
            result: "earlier".into(),
        }];

        let report = engine
            .run("c1", "hi", Vec::new(), seed, &sink)
            .await
            .unwrap();

        assert_eq!(report.state.invoked_nodes(), vec![NodeTag::Requirement]);
    }
}
