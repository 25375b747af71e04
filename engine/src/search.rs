//! Knowledge base search
//!
//! Handlers look up supporting material through the [`Search`] trait. How
//! documents are indexed and ranked is up to the implementation.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Default number of snippets a handler asks for
pub const DEFAULT_LIMIT: usize = 5;

/// One ranked search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub content: String,
    pub source: String,
    /// Relevance, higher is better
    pub score: f32,
}

#[async_trait]
pub trait Search: Send + Sync {
    /// Up to `limit` snippets, most relevant first
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Snippet>, EngineError>;
}

/// Search backend used when no knowledge base is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSearch;

#[async_trait]
impl Search for NullSearch {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Snippet>, EngineError> {
        Ok(Vec::new())
    }
}

/// Render snippets as numbered blocks for a prompt
pub fn format_snippets(snippets: &[Snippet]) -> String {
    if snippets.is_empty() {
        return "No relevant knowledge found".to_string();
    }

    let mut out = String::new();
    for (i, s) in snippets.iter().enumerate() {
        let _ = writeln!(out, "[{}] Source: {}", i + 1, s.source);
        let _ = writeln!(out, "Relevance: {:.2}", s.score);
        let _ = writeln!(out, "Content: {}\n", s.content);
    }
    out
}

/// Distinct sources in rank order
pub fn sources(snippets: &[Snippet]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for s in snippets {
        if !seen.contains(&s.source) {
            seen.push(s.source.clone());
        }
    }
    seen
}
