//! Shared fakes for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use envoy_engine::db::{InMemoryPersistence, Persistence};
use envoy_engine::graph::{
    ClassificationResult, ClassifierService, ClassifyError, ClassifyRequest, HandlerOutput,
    HandlerRequest, HandlerSet, NodeTag, ToolHandler,
};
use envoy_engine::memory::Clock;
use envoy_engine::stream::{EventSink, Transport};
use sdk::errors::EngineError;
use sdk::types::{ClientMessage, MessageStatus, Role, Turn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One scripted classify call: tokens to stream, then the decision
pub struct Step {
    pub tokens: Vec<String>,
    pub decision: Result<ClassificationResult, ClassifyError>,
}

impl Step {
    pub fn dispatch(node: NodeTag, input: &str) -> Self {
        Self {
            tokens: Vec::new(),
            decision: Ok(ClassificationResult::dispatch(node, input).unwrap()),
        }
    }

    pub fn answer(output: &str) -> Self {
        Self {
            tokens: Vec::new(),
            decision: Ok(ClassificationResult::terminal(output)),
        }
    }

    pub fn malformed(reason: &str) -> Self {
        Self {
            tokens: Vec::new(),
            decision: Err(ClassifyError::Malformed(reason.to_string())),
        }
    }

    pub fn with_tokens(mut self, tokens: &[&str]) -> Self {
        self.tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// Classifier that plays back a fixed script.
///
/// Once the script runs out it keeps dispatching to `exhausted`, or answers
/// "default" when that is `None`.
pub struct ScriptedClassifier {
    steps: Mutex<VecDeque<Step>>,
    exhausted: Option<NodeTag>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            exhausted: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Never answers; always dispatches to `node`
    pub fn looping(node: NodeTag) -> Self {
        Self::then_loop(Vec::new(), node)
    }

    /// Plays `steps`, then keeps dispatching to `node`
    pub fn then_loop(steps: Vec<Step>, node: NodeTag) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            exhausted: Some(node),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierService for ScriptedClassifier {
    async fn classify(
        &self,
        _request: ClassifyRequest<'_>,
        sink: &EventSink,
    ) -> Result<ClassificationResult, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();

        let Some(step) = step else {
            return match self.exhausted {
                Some(node) => Ok(ClassificationResult::dispatch(node, "again").unwrap()),
                None => Ok(ClassificationResult::terminal("default")),
            };
        };

        for token in &step.tokens {
            sink.token(token).await?;
        }
        step.decision
    }
}

/// Handler that answers with a fixed text and counts invocations
pub struct CountingHandler {
    reply: String,
    inputs: Mutex<Vec<String>>,
}

impl CountingHandler {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolHandler for CountingHandler {
    async fn invoke(
        &self,
        request: HandlerRequest<'_>,
        _sink: &EventSink,
    ) -> Result<HandlerOutput, EngineError> {
        self.inputs.lock().unwrap().push(request.input.to_string());
        Ok(HandlerOutput::text(self.reply.as_str()))
    }
}

/// Handler that always fails
pub struct FailingHandler;

#[async_trait]
impl ToolHandler for FailingHandler {
    async fn invoke(
        &self,
        _request: HandlerRequest<'_>,
        _sink: &EventSink,
    ) -> Result<HandlerOutput, EngineError> {
        Err(EngineError::LLMProvider("upstream timeout".into()))
    }
}

/// The same handler behind every dispatch node
pub fn uniform_handlers(handler: Arc<dyn ToolHandler>) -> HandlerSet {
    HandlerSet::new(Arc::clone(&handler), Arc::clone(&handler), handler)
}

/// Transport that records every message it accepts.
///
/// With `fail_after = Some(n)` it accepts `n` messages and then fails every
/// push, like a client that disconnected.
pub struct RecordingTransport {
    messages: Mutex<Vec<ClientMessage>>,
    attempts: AtomicUsize,
    fail_after: Option<usize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail_after: None,
        }
    }

    pub fn failing_after(accepted: usize) -> Self {
        Self {
            fail_after: Some(accepted),
            ..Self::new()
        }
    }

    pub fn messages(&self) -> Vec<ClientMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<MessageStatus> {
        self.messages().iter().map(|m| m.status).collect()
    }

    /// Pushes attempted, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn push(&self, message: &ClientMessage) -> Result<(), EngineError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if matches!(self.fail_after, Some(limit) if attempt >= limit) {
            return Err(EngineError::TransportDelivery("client went away".into()));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Persistence whose system-turn appends fail
#[derive(Default)]
pub struct RejectingPersistence {
    inner: InMemoryPersistence,
}

#[async_trait]
impl Persistence for RejectingPersistence {
    async fn create_conversation(&self) -> Result<String, EngineError> {
        self.inner.create_conversation().await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), EngineError> {
        if role == Role::System {
            return Err(EngineError::Persistence("disk full".into()));
        }
        self.inner.append_message(conversation_id, role, content).await
    }

    async fn get_history(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<Vec<Turn>, EngineError> {
        self.inner.get_history(conversation_id, limit).await
    }

    async fn latest_message(&self, conversation_id: &str) -> Result<Option<Turn>, EngineError> {
        self.inner.latest_message(conversation_id).await
    }
}

/// Manually advanced clock
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
