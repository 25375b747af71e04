//! Error types and handling
//!
//! This module provides the error types used throughout the Envoy engine.
//! All errors implement the `EnvoyErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! User hints are static strings. They never echo provider responses,
//! conversation content or database paths back to a client.

use thiserror::Error;

/// Trait for Envoy error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait EnvoyErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to push to a connected client as the text of an
    /// `error` status message.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are handled where they occur (a fallback answer,
    /// a dropped subscriber). Non-recoverable errors abort the current turn.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Storage**: SQLite and durable history failures
/// - **LLM Provider**: API failures, authentication errors
/// - **Orchestration**: classification, handler and iteration-limit failures
/// - **Delivery**: subscriber push failures and closed event streams
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, EnvoyErrorExt};
///
/// let error = EngineError::ClassificationParse("missing next_node".to_string());
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::ToolHandler {
///     node: "estimation".to_string(),
///     message: "upstream timeout".to_string(),
/// };
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // LLM provider errors
    #[error("LLM provider error: {0}")]
    LLMProvider(String),

    // Orchestration errors
    #[error("Classification parse error: {0}")]
    ClassificationParse(String),

    #[error("Tool handler '{node}' failed: {message}")]
    ToolHandler { node: String, message: String },

    #[error("Iteration limit of {limit} exceeded")]
    IterationLimitExceeded { limit: usize },

    // Delivery errors
    #[error("Transport delivery failed: {0}")]
    TransportDelivery(String),

    #[error("Event stream closed")]
    StreamClosed,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvoyErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::Database(_) => "Database operation failed. Try restarting the server",
            Self::Persistence(_) => "Could not save the conversation. Please try again",

            Self::LLMProvider(_) => "The language model is unavailable. Check your API key and network",

            Self::ClassificationParse(_) => "Sorry, I could not understand that request",
            Self::ToolHandler { .. } => "Something went wrong while preparing the answer",
            Self::IterationLimitExceeded { .. } => {
                "Sorry, I was unable to complete that request. Try breaking it into smaller questions"
            }

            Self::TransportDelivery(_) => "Connection lost. Reconnect to continue",
            Self::StreamClosed => "The response stream was interrupted",

            Self::Network(_) => "Network operation failed. Check your connection",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Database(_)
            | Self::Persistence(_)
            | Self::LLMProvider(_)
            | Self::ToolHandler { .. }
            | Self::StreamClosed => false,

            Self::Config(_)
            | Self::ClassificationParse(_)
            | Self::IterationLimitExceeded { .. }
            | Self::TransportDelivery(_)
            | Self::Network(_)
            | Self::Io(_) => true,
        }
    }
}
