//! Run event stream
//!
//! A graph run reports its progress as an ordered sequence of
//! [`StreamEvent`]s written into a bounded channel. The [`StreamMultiplexer`]
//! on the other end filters and tags them for live clients.
//!
//! The channel is bounded so a slow consumer applies back-pressure to the
//! run instead of letting buffered tokens grow without limit. Dropping the
//! receiving side closes the sink; the next emission then fails with
//! [`EngineError::StreamClosed`], which is how a consumer stops a run.

pub mod filter;
pub mod multiplexer;
pub mod registry;

pub use filter::PayloadFilter;
pub use multiplexer::{ForwardReport, StreamMultiplexer};
pub use registry::{ChannelTransport, ConnectionRegistry, DeliveryReport, SubscriberId, Transport};

use sdk::errors::EngineError;
use tokio::sync::mpsc;

use crate::graph::{NodeTag, ToolResponse};

/// Channel buffer size for run event channels
pub const CHANNEL_BUFFER_SIZE: usize = 100;

/// One event produced by a graph run
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A raw fragment of model output
    TokenDelta { text: String },
    /// A node finished
    NodeLifecycle {
        node: NodeTag,
        output: String,
        is_final: bool,
        /// Snapshot of the run's tool responses at emission time
        tool_responses: Vec<ToolResponse>,
    },
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        StreamEvent::TokenDelta { text: text.into() }
    }

    pub fn is_end(&self) -> bool {
        matches!(
            self,
            StreamEvent::NodeLifecycle {
                node: NodeTag::End,
                ..
            }
        )
    }
}

/// Sending half of a run's event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub async fn emit(&self, event: StreamEvent) -> Result<(), EngineError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| EngineError::StreamClosed)
    }

    /// Emit a token fragment. Empty fragments are skipped.
    pub async fn token(&self, text: &str) -> Result<(), EngineError> {
        if text.is_empty() {
            return Ok(());
        }
        self.emit(StreamEvent::token(text)).await
    }

    pub async fn lifecycle(
        &self,
        node: NodeTag,
        output: impl Into<String>,
        is_final: bool,
        tool_responses: Vec<ToolResponse>,
    ) -> Result<(), EngineError> {
        self.emit(StreamEvent::NodeLifecycle {
            node,
            output: output.into(),
            is_final,
            tool_responses,
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a bounded event channel for one run
pub fn channel() -> (EventSink, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    (EventSink { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (sink, mut rx) = channel();

        sink.token("a").await.unwrap();
        sink.token("").await.unwrap();
        sink.lifecycle(NodeTag::Main, "done", true, Vec::new())
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), StreamEvent::token("a"));
        let next = rx.recv().await.unwrap();
        assert!(matches!(
            next,
            StreamEvent::NodeLifecycle { node: NodeTag::Main, is_final: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_sink() {
        let (sink, rx) = channel();
        drop(rx);

        assert!(sink.is_closed());
        let err = sink.token("late").await.unwrap_err();
        assert!(matches!(err, EngineError::StreamClosed));
    }
}
