//! Chat service
//!
//! Runs one user turn end to end: seeds memory from durable history, stores
//! the user message, drives the graph while the multiplexer forwards its
//! events, and commits the exchange to memory once the run has answered.

use sdk::errors::{EngineError, EnvoyErrorExt};
use sdk::types::{MessageStatus, Role, Turn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agents::{CompanyHandler, EstimationHandler, LlmClassifier, RequirementHandler};
use crate::config::{Config, SummarizerKind};
use crate::db::Persistence;
use crate::graph::{GraphEngine, HandlerSet, Termination};
use crate::llm::ChatClient;
use crate::memory::{LlmSummarizer, MemoryStore, Summarizer, TranscriptSummarizer};
use crate::search::Search;
use crate::stream::{self, ConnectionRegistry, StreamMultiplexer};

/// Result of a turn that reached END
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub response: String,
    pub termination: Termination,
    pub iterations: usize,
    /// `streaming` messages published during the turn
    pub streamed: usize,
}

pub struct ChatService {
    engine: Arc<GraphEngine>,
    multiplexer: Arc<StreamMultiplexer>,
    persistence: Arc<dyn Persistence>,
    memory: Arc<MemoryStore>,
    history_limit: u32,
}

impl ChatService {
    pub fn new(
        engine: Arc<GraphEngine>,
        multiplexer: Arc<StreamMultiplexer>,
        persistence: Arc<dyn Persistence>,
        memory: Arc<MemoryStore>,
        history_limit: u32,
    ) -> Self {
        Self {
            engine,
            multiplexer,
            persistence,
            memory,
            history_limit,
        }
    }

    /// Wire the model-backed agents, memory and multiplexer from config
    pub fn from_config(
        config: &Config,
        client: Arc<dyn ChatClient>,
        search: Arc<dyn Search>,
        persistence: Arc<dyn Persistence>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let engine = Arc::new(build_engine(config, Arc::clone(&client), search));

        let summarizer: Arc<dyn Summarizer> = match config.memory.summarizer {
            SummarizerKind::Transcript => {
                Arc::new(TranscriptSummarizer::new(config.memory.summary_max_chars))
            }
            SummarizerKind::Llm => Arc::new(LlmSummarizer::new(
                client,
                config.llm.classifier_temperature,
            )),
        };
        let memory = Arc::new(MemoryStore::new(
            config.memory.max_history,
            config.memory_ttl(),
            summarizer,
        ));

        let multiplexer = Arc::new(StreamMultiplexer::new(registry, Arc::clone(&persistence)));

        Self::new(
            engine,
            multiplexer,
            persistence,
            memory,
            config.persistence.history_limit,
        )
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.multiplexer.registry()
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Run one turn to completion.
    ///
    /// Every path ends with either a `completed` or an `error` status pushed
    /// to the conversation's subscribers.
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        message: &str,
    ) -> Result<TurnOutcome, EngineError> {
        let durable = match self
            .persistence
            .get_history(conversation_id, self.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => return Err(self.abort(conversation_id, e).await),
        };
        self.memory.initialize(conversation_id, &durable).await;
        let history = self.memory.get_history(conversation_id).await;

        if let Err(e) = self
            .persistence
            .append_message(conversation_id, Role::User, message)
            .await
        {
            return Err(self.abort(conversation_id, e).await);
        }

        self.multiplexer
            .publish(conversation_id, MessageStatus::Started, message)
            .await;

        let (sink, events) = stream::channel();
        let engine = &self.engine;
        let run = async move {
            let result = engine
                .run(conversation_id, message, history, Vec::new(), &sink)
                .await;
            // Closing the sink lets the forwarder drain and stop.
            drop(sink);
            result
        };

        let (run_result, forward_result) =
            tokio::join!(run, self.multiplexer.forward(conversation_id, events));

        let forwarded = match forward_result {
            Ok(report) => report,
            Err(e) => return Err(self.abort(conversation_id, e).await),
        };

        let report = match run_result {
            Ok(report) => report,
            Err(failure) => {
                error!(
                    conversation_id,
                    node = %failure.state.current_node,
                    tool_responses = failure.state.tool_responses().len(),
                    error = %failure.error,
                    "Turn failed"
                );
                let notice = failure.error.user_hint().to_string();
                self.multiplexer
                    .publish_error(conversation_id, notice.as_str())
                    .await;
                if let Err(e) = self
                    .persistence
                    .append_message(conversation_id, Role::System, &notice)
                    .await
                {
                    warn!(conversation_id, error = %e, "Failed to persist error notice");
                }
                return Err(failure.error);
            }
        };

        let response = report.response().to_string();
        self.memory
            .add_exchange(
                conversation_id,
                Turn::user(message),
                Turn::system(response.as_str()),
            )
            .await;

        info!(
            conversation_id,
            iterations = report.iterations,
            termination = ?report.termination,
            streamed = forwarded.streamed,
            "Turn completed"
        );

        Ok(TurnOutcome {
            response,
            termination: report.termination,
            iterations: report.iterations,
            streamed: forwarded.streamed,
        })
    }

    /// Start a turn in the background and return its conversation id.
    ///
    /// A new conversation is created when none is given.
    pub async fn submit(
        self: &Arc<Self>,
        conversation_id: Option<String>,
        message: String,
    ) -> Result<String, EngineError> {
        let conversation_id = match conversation_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => self.persistence.create_conversation().await?,
        };

        let service = Arc::clone(self);
        let id = conversation_id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.run_turn(&id, &message).await {
                debug!(conversation_id = %id, error = %e, "Background turn ended with error");
            }
        });

        Ok(conversation_id)
    }

    /// Log a stop, push an `error` status and hand the error back
    async fn abort(&self, conversation_id: &str, error: EngineError) -> EngineError {
        error!(conversation_id, error = %error, "Turn stopped");
        self.multiplexer
            .publish_error(conversation_id, error.user_hint())
            .await;
        error
    }
}

/// Build the graph engine with the model-backed classifier and handlers
pub fn build_engine(
    config: &Config,
    client: Arc<dyn ChatClient>,
    search: Arc<dyn Search>,
) -> GraphEngine {
    let temperature = config.llm.handler_temperature;
    let handlers = HandlerSet::new(
        Arc::new(RequirementHandler::new(
            Arc::clone(&client),
            Arc::clone(&search),
            temperature,
        )),
        Arc::new(EstimationHandler::new(
            Arc::clone(&client),
            Arc::clone(&search),
            temperature,
        )),
        Arc::new(CompanyHandler::new(Arc::clone(&client), search, temperature)),
    );
    let classifier = Arc::new(LlmClassifier::new(
        client,
        config.llm.classifier_temperature,
    ));

    GraphEngine::new(classifier, handlers, &config.graph)
}

/// Evict idle conversations from `memory` every `interval`
pub fn spawn_eviction_sweeper(memory: Arc<MemoryStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = memory.evict_expired(memory.now()).await;
            debug!(evicted, "Eviction sweep");
        }
    })
}
