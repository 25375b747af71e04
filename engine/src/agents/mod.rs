//! Model-backed agents
//!
//! The classifier decides what happens next in a run; the three handlers do
//! the specialist work behind each dispatch node. All of them talk to a
//! [`ChatClient`](crate::llm::ChatClient) and, where they need background
//! material, a [`Search`](crate::search::Search) backend.

pub mod classifier;
pub mod company;
pub mod estimation;
pub mod requirement;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::LlmClassifier;
pub use company::CompanyHandler;
pub use estimation::EstimationHandler;
pub use requirement::RequirementHandler;

use sdk::types::{Role, Turn};
use std::fmt::Write;

/// Placeholder used when a conversation has no earlier turns
pub const NO_HISTORY: &str = "No previous conversation";

/// Render history one turn per line for a prompt
pub fn format_history(history: &[Turn]) -> String {
    if history.is_empty() {
        return NO_HISTORY.to_string();
    }

    let mut out = String::new();
    for turn in history {
        let speaker = match turn.role {
            Role::User => "User",
            Role::System => "Assistant",
        };
        let _ = writeln!(out, "{}- {}", speaker, turn.content);
    }
    out
}
