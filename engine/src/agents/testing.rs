//! Scripted chat and search backends for agent tests

use async_trait::async_trait;
use sdk::errors::EngineError;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::llm::{self, ChatClient, ChatMessage, LLMError};
use crate::search::{Search, Snippet};
use crate::stream::EventSink;

/// Replies with canned text and records every user prompt it was sent
pub struct ScriptedChat {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    fail: bool,
}

impl ScriptedChat {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn next(&self, messages: &[ChatMessage]) -> llm::Result<String> {
        if let Some(last) = messages.last() {
            self.prompts.lock().unwrap().push(last.content.clone());
        }
        if self.fail {
            return Err(LLMError::NetworkError("connection refused".into()));
        }
        Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, messages: &[ChatMessage], _temperature: f32) -> llm::Result<String> {
        self.next(messages)
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
        sink: &EventSink,
    ) -> llm::Result<String> {
        let reply = self.next(messages)?;
        for word in reply.split_inclusive(' ') {
            sink.token(word)
                .await
                .map_err(|_| LLMError::StreamClosed)?;
        }
        Ok(reply)
    }
}

/// Returns the same snippets for every query and counts calls
pub struct FixedSearch {
    snippets: Vec<Snippet>,
    calls: Mutex<Vec<String>>,
}

impl FixedSearch {
    pub fn new(snippets: Vec<Snippet>) -> Self {
        Self {
            snippets,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn one(source: &str, content: &str) -> Self {
        Self::new(vec![Snippet {
            content: content.to_string(),
            source: source.to_string(),
            score: 0.8,
        }])
    }

    pub fn queries(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Search for FixedSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Snippet>, EngineError> {
        self.calls.lock().unwrap().push(query.to_string());
        Ok(self.snippets.iter().take(limit).cloned().collect())
    }
}
