//! Classify/dispatch state machine
//!
//! One user turn is driven through a small closed graph:
//!
//! ```text
//!            +-------------+
//!            |    MAIN     |<----------------------+
//!            +------+------+                       |
//!   is_final        |  next node                   |
//!       v           v                              |
//!     END   REQUIREMENT | ESTIMATION | COMPANY ----+
//! ```
//!
//! MAIN asks the classifier what to do next. Every dispatch state runs its
//! handler and returns to MAIN. END has no outgoing edge.

pub mod classifier;
pub mod engine;

pub use classifier::{
    parse_classification, ClassificationResult, ClassifierService, ClassifyError, ClassifyRequest,
};
pub use engine::{
    GraphEngine, HandlerOutput, HandlerRequest, HandlerSet, KnowledgeContext, RunFailure,
    RunReport, Termination, ToolHandler,
};

use sdk::types::Turn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key under which handler knowledge is kept in [`RunState::aux_data`]
pub const KNOWLEDGE_KEY: &str = "knowledge_result";

/// Node identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeTag {
    #[serde(rename = "main")]
    Main,
    #[serde(rename = "requirement")]
    Requirement,
    #[serde(rename = "estimation")]
    Estimation,
    #[serde(rename = "company")]
    Company,
    #[serde(rename = "__end__")]
    End,
}

impl NodeTag {
    /// Nodes that run a specialist handler
    pub const DISPATCH: [NodeTag; 3] = [NodeTag::Requirement, NodeTag::Estimation, NodeTag::Company];

    pub fn is_dispatch(&self) -> bool {
        matches!(
            self,
            NodeTag::Requirement | NodeTag::Estimation | NodeTag::Company
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeTag::Main => "main",
            NodeTag::Requirement => "requirement",
            NodeTag::Estimation => "estimation",
            NodeTag::Company => "company",
            NodeTag::End => "__end__",
        }
    }

    /// Parse a wire node name, case-insensitively. `end` is accepted for `__end__`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "main" => Some(NodeTag::Main),
            "requirement" => Some(NodeTag::Requirement),
            "estimation" => Some(NodeTag::Estimation),
            "company" => Some(NodeTag::Company),
            "__end__" | "end" => Some(NodeTag::End),
            _ => None,
        }
    }
}

impl fmt::Display for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition function of the graph.
///
/// MAIN follows the classification; dispatch states always return to MAIN;
/// END has no successor.
pub fn route(current: NodeTag, classification: &ClassificationResult) -> Option<NodeTag> {
    match current {
        NodeTag::Main => Some(if classification.is_final() {
            NodeTag::End
        } else {
            classification.next_node()
        }),
        NodeTag::Requirement | NodeTag::Estimation | NodeTag::Company => Some(NodeTag::Main),
        NodeTag::End => None,
    }
}

/// Result recorded for one handler invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub node: NodeTag,
    pub result: String,
}

/// State of one in-flight turn. Owned by exactly one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub message: String,
    pub conversation_id: String,
    pub history: Vec<Turn>,
    pub current_node: NodeTag,
    pub last_input: String,
    tool_responses: Vec<ToolResponse>,
    pub response: Option<String>,
    pub is_final: bool,
    pub aux_data: serde_json::Map<String, serde_json::Value>,
}

impl RunState {
    pub fn new(
        conversation_id: impl Into<String>,
        message: impl Into<String>,
        history: Vec<Turn>,
        seed: Vec<ToolResponse>,
    ) -> Self {
        Self {
            message: message.into(),
            conversation_id: conversation_id.into(),
            history,
            current_node: NodeTag::Main,
            last_input: String::new(),
            tool_responses: seed,
            response: None,
            is_final: false,
            aux_data: serde_json::Map::new(),
        }
    }

    /// Tool responses in invocation order
    pub fn tool_responses(&self) -> &[ToolResponse] {
        &self.tool_responses
    }

    /// Append a record. The sequence is never truncated or reordered.
    pub fn record(&mut self, node: NodeTag, result: impl Into<String>) {
        self.tool_responses.push(ToolResponse {
            node,
            result: result.into(),
        });
    }

    /// Names of nodes already invoked in this run, first-invocation order
    pub fn invoked_nodes(&self) -> Vec<NodeTag> {
        let mut seen = Vec::new();
        for r in &self.tool_responses {
            if !seen.contains(&r.node) {
                seen.push(r.node);
            }
        }
        seen
    }

    /// Most recent record for a node
    pub fn latest_for(&self, node: NodeTag) -> Option<&ToolResponse> {
        self.tool_responses.iter().rev().find(|r| r.node == node)
    }

    pub fn knowledge(&self) -> Option<&str> {
        self.aux_data.get(KNOWLEDGE_KEY).and_then(|v| v.as_str())
    }

    pub fn set_knowledge(&mut self, knowledge: String) {
        self.aux_data
            .insert(KNOWLEDGE_KEY.to_string(), serde_json::Value::String(knowledge));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_states_return_to_main() {
        let terminal = ClassificationResult::terminal("done");
        for node in NodeTag::DISPATCH {
            assert_eq!(route(node, &terminal), Some(NodeTag::Main));
        }
    }

    #[test]
    fn test_main_follows_classification() {
        let dispatch = ClassificationResult::dispatch(NodeTag::Estimation, "app").unwrap();
        assert_eq!(route(NodeTag::Main, &dispatch), Some(NodeTag::Estimation));

        let terminal = ClassificationResult::terminal("bye");
        assert_eq!(route(NodeTag::Main, &terminal), Some(NodeTag::End));
        assert_eq!(route(NodeTag::End, &terminal), None);
    }

    #[test]
    fn test_node_names() {
        assert_eq!(NodeTag::parse("Requirement"), Some(NodeTag::Requirement));
        assert_eq!(NodeTag::parse("END"), Some(NodeTag::End));
        assert_eq!(NodeTag::parse("general"), None);
        assert_eq!(
            serde_json::to_value(NodeTag::End).unwrap(),
            serde_json::json!("__end__")
        );
    }

    #[test]
    fn test_record_is_append_only() {
        let mut state = RunState::new("c", "m", Vec::new(), Vec::new());
        state.record(NodeTag::Requirement, "r1");
        state.record(NodeTag::Company, "c1");
        state.record(NodeTag::Requirement, "r2");

        assert_eq!(state.tool_responses().len(), 3);
        assert_eq!(state.latest_for(NodeTag::Requirement).unwrap().result, "r2");
        assert_eq!(
            state.invoked_nodes(),
            vec![NodeTag::Requirement, NodeTag::Company]
        );
    }
}
