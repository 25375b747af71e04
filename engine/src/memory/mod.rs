//! Conversation Memory
//!
//! Keeps a bounded, summarized, expiring history per conversation id,
//! independent of any particular run.
//!
//! - History holds at most `max_history` turns; the oldest go first
//! - Every exchange is folded into a rolling summary
//! - Every read or write refreshes the entry's last access time; entries
//!   idle for longer than the TTL are removed by [`MemoryStore::evict_expired`]
//!
//! Each conversation has its own lock, so operations on one conversation
//! are serialized and never wait on another conversation.

pub mod summary;

pub use summary::{LlmSummarizer, Summarizer, TranscriptSummarizer};

use chrono::{DateTime, Duration, Utc};
use sdk::types::{Role, Turn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
struct ConversationMemory {
    history: VecDeque<Turn>,
    summary: String,
    last_access: DateTime<Utc>,
    /// Set once the entry has been unlinked by `clear`
    removed: bool,
}

impl ConversationMemory {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            history: VecDeque::new(),
            summary: String::new(),
            last_access: now,
            removed: false,
        }
    }

    fn push_bounded(&mut self, turn: Turn, max_history: usize) {
        self.history.push_back(turn);
        while self.history.len() > max_history {
            self.history.pop_front();
        }
    }
}

type Entry = Arc<Mutex<ConversationMemory>>;

/// Per-conversation bounded memory
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    max_history: usize,
    ttl: Duration,
    summarizer: Arc<dyn Summarizer>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(
        max_history: usize,
        ttl: std::time::Duration,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self::with_clock(max_history, ttl, summarizer, Arc::new(SystemClock))
    }

    pub fn with_clock(
        max_history: usize,
        ttl: std::time::Duration,
        summarizer: Arc<dyn Summarizer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_history: max_history.max(1),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::weeks(52 * 100)),
            summarizer,
            clock,
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Seed a conversation from durable history.
    ///
    /// Only an entry with no history is seeded; a live entry already holds
    /// at least as much as the durable copy. The seed is trimmed to the most
    /// recent `max_history` turns; each user turn directly followed by a
    /// system turn is replayed into the summary as one exchange.
    pub async fn initialize(&self, conversation_id: &str, seed: &[Turn]) {
        let mut memory = self.lock_entry(conversation_id).await;
        memory.last_access = self.clock.now();

        if !memory.history.is_empty() || seed.is_empty() {
            return;
        }

        let skip = seed.len().saturating_sub(self.max_history);
        let trimmed = &seed[skip..];
        memory.history = trimmed.iter().cloned().collect();

        for (user, system) in exchanges(trimmed) {
            let current = std::mem::take(&mut memory.summary);
            memory.summary = self.fold(conversation_id, &current, user, system).await;
        }

        debug!(
            conversation_id,
            seeded = trimmed.len(),
            "Conversation memory initialized"
        );
    }

    /// Record a finished exchange
    pub async fn add_exchange(&self, conversation_id: &str, user: Turn, system: Turn) {
        let mut memory = self.lock_entry(conversation_id).await;

        let current = std::mem::take(&mut memory.summary);
        memory.summary = self.fold(conversation_id, &current, &user, &system).await;
        memory.push_bounded(user, self.max_history);
        memory.push_bounded(system, self.max_history);
        memory.last_access = self.clock.now();
    }

    /// Copy of the retained history, oldest first
    pub async fn get_history(&self, conversation_id: &str) -> Vec<Turn> {
        let mut memory = self.lock_entry(conversation_id).await;
        memory.last_access = self.clock.now();
        memory.history.iter().cloned().collect()
    }

    pub async fn get_summary(&self, conversation_id: &str) -> String {
        let mut memory = self.lock_entry(conversation_id).await;
        memory.last_access = self.clock.now();
        memory.summary.clone()
    }

    /// Remove a conversation. Returns whether it existed.
    ///
    /// Waits for the operation currently holding the entry. Operations
    /// queued behind the clear start over on a fresh entry.
    pub async fn clear(&self, conversation_id: &str) -> bool {
        let Some(entry) = self.entries.read().await.get(conversation_id).cloned() else {
            return false;
        };

        let mut memory = entry.lock().await;
        let mut entries = self.entries.write().await;
        match entries.get(conversation_id) {
            Some(current) if Arc::ptr_eq(current, &entry) => {
                entries.remove(conversation_id);
                memory.removed = true;
                true
            }
            // Another clear got there first
            _ => false,
        }
    }

    /// Remove every entry idle for longer than the TTL at `now`.
    ///
    /// Entries currently in use are skipped; they are not idle.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();

        entries.retain(|_, entry| {
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            match entry.try_lock() {
                Ok(memory) => now.signed_duration_since(memory.last_access) <= self.ttl,
                Err(_) => true,
            }
        });

        let evicted = before - entries.len();
        if evicted > 0 {
            info!(evicted, remaining = entries.len(), "Evicted idle conversations");
        }
        evicted
    }

    /// Whether an entry exists. Does not count as an access.
    pub async fn contains(&self, conversation_id: &str) -> bool {
        self.entries.read().await.contains_key(conversation_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Lock a conversation's entry, creating it if needed
    async fn lock_entry(&self, conversation_id: &str) -> OwnedMutexGuard<ConversationMemory> {
        loop {
            let memory = self.entry(conversation_id).await.lock_owned().await;
            if !memory.removed {
                return memory;
            }
        }
    }

    async fn entry(&self, conversation_id: &str) -> Entry {
        if let Some(entry) = self.entries.read().await.get(conversation_id) {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write().await;
        let now = self.clock.now();
        Arc::clone(
            entries
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ConversationMemory::new(now)))),
        )
    }

    /// Fold one exchange into the summary, keeping the old one on failure
    async fn fold(
        &self,
        conversation_id: &str,
        current: &str,
        user: &Turn,
        system: &Turn,
    ) -> String {
        match self.summarizer.summarize(current, user, system).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(conversation_id, error = %e, "Summarizer failed, keeping previous summary");
                current.to_string()
            }
        }
    }
}

/// User turns directly answered by a system turn
fn exchanges(turns: &[Turn]) -> impl Iterator<Item = (&Turn, &Turn)> {
    turns
        .windows(2)
        .filter(|w| w[0].role == Role::User && w[1].role == Role::System)
        .map(|w| (&w[0], &w[1]))
}
