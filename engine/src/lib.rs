//! Envoy Engine Library
//!
//! This library provides the core functionality of the Envoy conversation
//! orchestrator. It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Structured logging setup
pub mod telemetry;

/// Database persistence module
pub mod db;

/// LLM provider abstraction layer
pub mod llm;

/// Classify/dispatch state machine
pub mod graph;

/// Client message streaming and subscriber registry
pub mod stream;

/// Bounded per-conversation memory
pub mod memory;

/// Knowledge base search
pub mod search;

/// Model-backed classifier and specialist handlers
pub mod agents;

/// Turn orchestration
pub mod service;

/// HTTP and WebSocket server
pub mod server;

/// CLI interface module
pub mod cli;

/// Command handlers for CLI operations
pub mod handlers;
