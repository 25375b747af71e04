//! Rolling conversation summaries

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::Turn;
use std::sync::Arc;

use crate::llm::{ChatClient, ChatMessage};

/// Folds one exchange into a conversation summary
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        current: &str,
        user: &Turn,
        system: &Turn,
    ) -> Result<String, EngineError>;
}

/// Keeps a compact transcript of the most recent exchanges
pub struct TranscriptSummarizer {
    max_chars: usize,
}

impl TranscriptSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }
}

#[async_trait]
impl Summarizer for TranscriptSummarizer {
    async fn summarize(
        &self,
        current: &str,
        user: &Turn,
        system: &Turn,
    ) -> Result<String, EngineError> {
        let mut summary = current.to_string();
        if !summary.is_empty() {
            summary.push('\n');
        }
        summary.push_str(&format!(
            "User: {}\nAssistant: {}",
            compact(&user.content),
            compact(&system.content)
        ));

        Ok(keep_tail(&summary, self.max_chars))
    }
}

/// Collapse runs of whitespace so each turn stays on one line
fn compact(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keep at most `max_chars` characters, dropping whole lines from the front
/// first and cutting mid-line only when a single line is too long.
fn keep_tail(summary: &str, max_chars: usize) -> String {
    if summary.chars().count() <= max_chars {
        return summary.to_string();
    }

    let lines: Vec<&str> = summary.lines().collect();
    let mut kept = 0;
    let mut total = 0;
    for line in lines.iter().rev() {
        let len = line.chars().count() + usize::from(kept > 0);
        if total + len > max_chars {
            break;
        }
        total += len;
        kept += 1;
    }

    if kept > 0 {
        return lines[lines.len() - kept..].join("\n");
    }

    let last = lines.last().copied().unwrap_or_default();
    let skip = last.chars().count().saturating_sub(max_chars);
    last.chars().skip(skip).collect()
}

const SUMMARY_PROMPT: &str = "Progressively summarize the lines of conversation provided, \
adding onto the previous summary and returning a new summary. Keep names, requirements, \
figures and decisions; drop pleasantries.";

/// Progressive summary written by the model
pub struct LlmSummarizer {
    client: Arc<dyn ChatClient>,
    temperature: f32,
}

impl LlmSummarizer {
    pub fn new(client: Arc<dyn ChatClient>, temperature: f32) -> Self {
        Self {
            client,
            temperature,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        current: &str,
        user: &Turn,
        system: &Turn,
    ) -> Result<String, EngineError> {
        let current = if current.is_empty() { "(none)" } else { current };
        let prompt = format!(
            "Current summary:\n{}\n\nNew lines of conversation:\nUser: {}\nAssistant: {}\n\nNew summary:",
            current, user.content, system.content
        );
        let messages = [ChatMessage::system(SUMMARY_PROMPT), ChatMessage::user(prompt)];

        let summary = self.client.chat(&messages, self.temperature).await?;
        Ok(summary.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transcript_appends_pairs() {
        let summarizer = TranscriptSummarizer::new(1000);

        let s1 = summarizer
            .summarize("", &Turn::user("hi\n there"), &Turn::system("hello"))
            .await
            .unwrap();
        let s2 = summarizer
            .summarize(&s1, &Turn::user("cost?"), &Turn::system("$10k"))
            .await
            .unwrap();

        assert_eq!(
            s2,
            "User: hi there\nAssistant: hello\nUser: cost?\nAssistant: $10k"
        );
    }

    #[test]
    fn test_keep_tail_drops_whole_lines() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(keep_tail(text, 9), "bbbb\ncccc");
        assert_eq!(keep_tail(text, 100), text);
    }

    #[test]
    fn test_keep_tail_cuts_long_line() {
        assert_eq!(keep_tail("abcdefgh", 3), "fgh");
        assert_eq!(keep_tail("ééééé", 2), "éé");
    }
}
