//! Connection registry
//!
//! Maps a conversation id to the set of live subscribers that should
//! receive its client messages. Each conversation's set sits behind its
//! own mutex, so broadcasts and membership changes for one conversation are
//! serialized while other conversations proceed independently.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::ClientMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

/// Longest a single push may take before the subscriber counts as gone
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one subscription within the registry
pub type SubscriberId = u64;

/// Delivery endpoint for one live client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message. An error means the endpoint is gone.
    async fn push(&self, message: &ClientMessage) -> Result<(), EngineError>;
}

/// Transport backed by a bounded channel drained by a socket task.
///
/// Never waits for room in the channel: a subscriber whose buffer is full
/// has stopped reading and is reported as failed.
pub struct ChannelTransport {
    tx: mpsc::Sender<ClientMessage>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<ClientMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn push(&self, message: &ClientMessage) -> Result<(), EngineError> {
        self.tx.try_send(message.clone()).map_err(|e| match e {
            TrySendError::Full(_) => {
                EngineError::TransportDelivery("subscriber is not keeping up".to_string())
            }
            TrySendError::Closed(_) => {
                EngineError::TransportDelivery("subscriber channel closed".to_string())
            }
        })
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub removed: usize,
}

struct Subscriber {
    id: SubscriberId,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct Room {
    subscribers: Vec<Subscriber>,
    /// Set once the room has been unlinked from the registry
    closed: bool,
}

/// Registry of live subscribers per conversation
#[derive(Default)]
pub struct ConnectionRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport for a conversation
    pub async fn subscribe(
        &self,
        conversation_id: &str,
        transport: Arc<dyn Transport>,
    ) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        loop {
            let room = {
                let mut rooms = self.rooms.write().await;
                Arc::clone(rooms.entry(conversation_id.to_string()).or_default())
            };

            let mut guard = room.lock().await;
            if guard.closed {
                // Lost a race with the room being emptied; unlink and retry
                drop(guard);
                self.unlink(conversation_id, &room).await;
                continue;
            }

            guard.subscribers.push(Subscriber {
                id,
                transport: Arc::clone(&transport),
            });
            debug!(conversation_id, subscriber_id = id, "Subscriber registered");
            return id;
        }
    }

    /// Remove one subscriber. Returns whether it was registered.
    pub async fn unsubscribe(&self, conversation_id: &str, id: SubscriberId) -> bool {
        let Some(room) = self.room(conversation_id).await else {
            return false;
        };

        let mut guard = room.lock().await;
        let before = guard.subscribers.len();
        guard.subscribers.retain(|s| s.id != id);
        let removed = guard.subscribers.len() != before;

        if guard.subscribers.is_empty() {
            guard.closed = true;
            drop(guard);
            self.unlink(conversation_id, &room).await;
        }

        if removed {
            debug!(conversation_id, subscriber_id = id, "Subscriber removed");
        }
        removed
    }

    /// Push a message to every subscriber of a conversation.
    ///
    /// A subscriber whose push fails or takes longer than [`PUSH_TIMEOUT`]
    /// is removed on the spot and never receives another push attempt. Other subscribers are unaffected.
    pub async fn broadcast(&self, message: &ClientMessage) -> DeliveryReport {
        let conversation_id = message.conversation_id.as_str();
        let Some(room) = self.room(conversation_id).await else {
            return DeliveryReport::default();
        };

        let mut report = DeliveryReport::default();
        let mut guard = room.lock().await;
        let mut failed = Vec::new();

        for sub in &guard.subscribers {
            let pushed = tokio::time::timeout(PUSH_TIMEOUT, sub.transport.push(message))
                .await
                .unwrap_or_else(|_| {
                    Err(EngineError::TransportDelivery("push timed out".to_string()))
                });
            match pushed {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        conversation_id,
                        subscriber_id = sub.id,
                        status = %message.status,
                        error = %e,
                        "Delivery failed, dropping subscriber"
                    );
                    failed.push(sub.id);
                }
            }
        }

        if !failed.is_empty() {
            guard.subscribers.retain(|s| !failed.contains(&s.id));
            report.removed = failed.len();
        }

        if guard.subscribers.is_empty() && !guard.closed {
            guard.closed = true;
            drop(guard);
            self.unlink(conversation_id, &room).await;
        }

        report
    }

    pub async fn subscriber_count(&self, conversation_id: &str) -> usize {
        match self.room(conversation_id).await {
            Some(room) => room.lock().await.subscribers.len(),
            None => 0,
        }
    }

    /// Number of conversations with at least one subscriber
    pub async fn active_conversations(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn room(&self, conversation_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(conversation_id).cloned()
    }

    async fn unlink(&self, conversation_id: &str, room: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(conversation_id)
            .is_some_and(|current| Arc::ptr_eq(current, room))
        {
            rooms.remove(conversation_id);
        }
    }
}
