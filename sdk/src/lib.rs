//! Envoy SDK
//!
//! Shared vocabulary for the Envoy engine and its adapters: the error
//! taxonomy, conversation turns and the client message schema.

/// Error types and handling
pub mod errors;

/// Conversation and client wire types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, EnvoyErrorExt};
pub use types::{ClientMessage, MessageStatus, Role, Turn};
