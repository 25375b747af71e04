//! CLI interface for Envoy
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Envoy conversation orchestrator
///
/// Routes each user message through a classifier and specialist handlers,
/// streaming the answer to connected clients.
#[derive(Parser, Debug)]
#[command(name = "envoy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one turn in the foreground and print its messages
    Ask {
        /// The message to send
        message: String,

        /// Continue an existing conversation
        #[arg(short, long, value_name = "ID")]
        conversation: Option<String>,

        /// Keep history in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// Show a conversation's stored messages
    History {
        /// Conversation ID
        conversation_id: String,

        /// Number of messages to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },
}
