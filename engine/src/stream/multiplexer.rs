//! Stream Multiplexer
//!
//! Turns a run's raw event sequence into the client message sequence:
//!
//! - token fragments pass through the payload filter and go out as
//!   `streaming`
//! - a node output goes out as `completed` (final) or `processing` and is
//!   appended to durable history as a system turn first
//! - a finished dispatch node goes out as `tool` with its latest result
//! - END stops forwarding
//!
//! Messages leave in exactly the order the events arrived. A failed
//! delivery only drops that subscriber; a failed history append stops the
//! forwarder, which closes the run's event channel.

use sdk::errors::EngineError;
use sdk::types::{ClientMessage, MessageStatus, Role};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::filter::PayloadFilter;
use super::registry::{ConnectionRegistry, DeliveryReport};
use super::StreamEvent;
use crate::db::Persistence;
use crate::graph::NodeTag;

/// Summary of one forwarded run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    /// `streaming` messages published
    pub streamed: usize,
    /// Text of the last `completed` message
    pub final_output: Option<String>,
    /// Subscribers dropped after a failed push
    pub removed_subscribers: usize,
    /// Whether the END event was seen
    pub ended: bool,
}

pub struct StreamMultiplexer {
    registry: Arc<ConnectionRegistry>,
    persistence: Arc<dyn Persistence>,
}

impl StreamMultiplexer {
    pub fn new(registry: Arc<ConnectionRegistry>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            registry,
            persistence,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Consume one run's events until END or until the sender goes away.
    pub async fn forward(
        &self,
        conversation_id: &str,
        mut events: mpsc::Receiver<StreamEvent>,
    ) -> Result<ForwardReport, EngineError> {
        let mut filter = PayloadFilter::new();
        let mut report = ForwardReport::default();

        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::TokenDelta { text } => {
                    if let Some(visible) = filter.push(&text) {
                        self.stream_fragment(conversation_id, visible, &mut report)
                            .await;
                    }
                }
                StreamEvent::NodeLifecycle {
                    node,
                    output,
                    is_final,
                    tool_responses,
                } => {
                    if let Some(held) = filter.flush_pending() {
                        self.stream_fragment(conversation_id, held, &mut report)
                            .await;
                    }

                    if node == NodeTag::End {
                        report.ended = true;
                        break;
                    }

                    if !output.is_empty() {
                        if let Err(e) = self
                            .persistence
                            .append_message(conversation_id, Role::System, &output)
                            .await
                        {
                            error!(
                                conversation_id,
                                node = %node,
                                error = %e,
                                "Failed to persist node output"
                            );
                            return Err(e);
                        }

                        let status = if is_final {
                            MessageStatus::Completed
                        } else {
                            MessageStatus::Processing
                        };
                        if is_final {
                            report.final_output = Some(output.clone());
                        }
                        let delivery = self.publish(conversation_id, status, output).await;
                        report.removed_subscribers += delivery.removed;
                    }

                    if node.is_dispatch() {
                        if let Some(latest) = tool_responses.iter().rev().find(|r| r.node == node)
                        {
                            let message = ClientMessage::tool(
                                conversation_id,
                                node.as_str(),
                                latest.result.as_str(),
                            );
                            let delivery = self.registry.broadcast(&message).await;
                            report.removed_subscribers += delivery.removed;
                        }
                    }
                }
            }
        }

        if !report.ended {
            if let Some(held) = filter.finish() {
                self.stream_fragment(conversation_id, held, &mut report)
                    .await;
            }
        }

        debug!(
            conversation_id,
            streamed = report.streamed,
            ended = report.ended,
            "Forwarding finished"
        );
        Ok(report)
    }

    /// Push one message to every subscriber of the conversation
    pub async fn publish(
        &self,
        conversation_id: &str,
        status: MessageStatus,
        message: impl Into<String>,
    ) -> DeliveryReport {
        self.registry
            .broadcast(&ClientMessage::new(conversation_id, status, message))
            .await
    }

    /// Push an `error` status carrying a user-safe text
    pub async fn publish_error(
        &self,
        conversation_id: &str,
        message: impl Into<String>,
    ) -> DeliveryReport {
        self.publish(conversation_id, MessageStatus::Error, message)
            .await
    }

    async fn stream_fragment(
        &self,
        conversation_id: &str,
        text: String,
        report: &mut ForwardReport,
    ) {
        let delivery = self
            .publish(conversation_id, MessageStatus::Streaming, text)
            .await;
        report.streamed += 1;
        report.removed_subscribers += delivery.removed;
    }
}
