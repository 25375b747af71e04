//! OpenAI-compatible chat client
//!
//! Talks to any `/chat/completions` endpoint that follows the OpenAI wire
//! format. Streaming replies arrive as server-sent events; each `data:` line
//! carries one JSON delta until the `[DONE]` marker.

use super::{ChatClient, ChatMessage, LLMError};
use crate::config::LLMConfig;
use crate::stream::EventSink;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub struct OpenAiClient {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LLMError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LLMError::NetworkError(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Build a client from config, reading the key from the configured
    /// environment variable.
    pub fn from_config(config: &LLMConfig) -> Result<Self, LLMError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            LLMError::AuthenticationFailed(format!(
                "environment variable {} is not set",
                config.api_key_env
            ))
        })?;

        Self::new(
            config.base_url.clone(),
            config.model.clone(),
            api_key,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        stream: bool,
    ) -> Result<reqwest::Response, LLMError> {
        let url = format!("{}/chat/completions", self.base_url);

        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "stream": stream,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(LLMError::AuthenticationFailed(text));
            } else if status.as_u16() == 429 {
                return Err(LLMError::RateLimitExceeded);
            } else {
                return Err(LLMError::InvalidRequest(text));
            }
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], temperature: f32) -> super::Result<String> {
        let response = self.send(messages, temperature, false).await?;

        let data: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LLMError::ParseError("No content in response".to_string()))
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        sink: &EventSink,
    ) -> super::Result<String> {
        let response = self.send(messages, temperature, true).await?;
        let mut bytes = response.bytes_stream();

        let mut buffer: Vec<u8> = Vec::new();
        let mut reply = String::new();

        'chunks: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(map_transport_error)?;
            buffer.extend_from_slice(&chunk);

            // Lines may be split across chunks; only complete lines are parsed
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line))? {
                    SseLine::Delta(text) => {
                        reply.push_str(&text);
                        sink.token(&text)
                            .await
                            .map_err(|_| LLMError::StreamClosed)?;
                    }
                    SseLine::Done => break 'chunks,
                    SseLine::Skip => {}
                }
            }
        }

        if !buffer.is_empty() {
            if let SseLine::Delta(text) = parse_sse_line(&String::from_utf8_lossy(&buffer))? {
                reply.push_str(&text);
                sink.token(&text)
                    .await
                    .map_err(|_| LLMError::StreamClosed)?;
            }
        }

        debug!(model = %self.model, chars = reply.len(), "Stream completed");
        Ok(reply)
    }
}

fn map_transport_error(e: reqwest::Error) -> LLMError {
    if e.is_timeout() {
        LLMError::Timeout
    } else {
        LLMError::NetworkError(e.to_string())
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// Parse one server-sent event line.
///
/// Comments, keep-alives, non-data fields and empty deltas are skipped.
fn parse_sse_line(line: &str) -> Result<SseLine, LLMError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| LLMError::ParseError(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(LLMError::InvalidRequest(error.message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty())
        .map(SseLine::Delta)
        .unwrap_or(SseLine::Skip))
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}
