//! Routing decisions
//!
//! The classifier decides, at every MAIN step, which specialist to run next
//! or that the turn is answered. Its reply is validated into a
//! [`ClassificationResult`] before the engine acts on it.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::Turn;
use serde_json::Value;

use super::{NodeTag, ToolResponse};
use crate::llm::extract_json_object;
use crate::stream::EventSink;

/// A validated routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    next_node: NodeTag,
    extracted_input: String,
    output: String,
    is_final: bool,
}

impl ClassificationResult {
    /// Route to a dispatch node with the text it should work on
    pub fn dispatch(node: NodeTag, input: impl Into<String>) -> Result<Self, EngineError> {
        if !node.is_dispatch() {
            return Err(EngineError::ClassificationParse(format!(
                "'{}' is not a dispatch node",
                node
            )));
        }
        Ok(Self {
            next_node: node,
            extracted_input: input.into(),
            output: String::new(),
            is_final: false,
        })
    }

    /// Finish the turn with `output` as the answer
    pub fn terminal(output: impl Into<String>) -> Self {
        Self {
            next_node: NodeTag::End,
            extracted_input: String::new(),
            output: output.into(),
            is_final: true,
        }
    }

    pub fn next_node(&self) -> NodeTag {
        self.next_node
    }

    pub fn extracted_input(&self) -> &str {
        &self.extracted_input
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }
}

/// Inputs to one classify call
#[derive(Debug, Clone, Copy)]
pub struct ClassifyRequest<'a> {
    pub message: &'a str,
    pub history: &'a [Turn],
    pub invoked_nodes: &'a [NodeTag],
    pub tool_responses: &'a [ToolResponse],
}

/// Why a classify call produced no usable decision
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// The reply did not match the decision schema
    #[error("Malformed classification: {0}")]
    Malformed(String),

    /// The classifier itself could not be reached or failed
    #[error(transparent)]
    Service(EngineError),
}

impl From<EngineError> for ClassifyError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ClassificationParse(reason) => ClassifyError::Malformed(reason),
            other => ClassifyError::Service(other),
        }
    }
}

#[async_trait]
pub trait ClassifierService: Send + Sync {
    async fn classify(
        &self,
        request: ClassifyRequest<'_>,
        sink: &EventSink,
    ) -> Result<ClassificationResult, ClassifyError>;
}

/// Validate raw classifier output.
///
/// Expects an object `{ "next_node", "inputs", "output", "is_final" }`,
/// optionally fenced or surrounded by prose.
pub fn parse_classification(text: &str) -> Result<ClassificationResult, EngineError> {
    let malformed = |reason: &str| EngineError::ClassificationParse(reason.to_string());

    let raw = extract_json_object(text).ok_or_else(|| malformed("no JSON object in reply"))?;
    let value: Value =
        serde_json::from_str(raw).map_err(|e| EngineError::ClassificationParse(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("reply is not a JSON object"))?;

    let is_final = match obj.get("is_final") {
        None | Some(Value::Null) => false,
        Some(v) => parse_flag(v).ok_or_else(|| malformed("is_final is not a boolean"))?,
    };

    let next_node = match obj.get("next_node") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(NodeTag::parse(s).ok_or_else(|| {
            EngineError::ClassificationParse(format!("unknown node '{}'", s))
        })?),
        Some(_) => return Err(malformed("next_node is not a string")),
    };

    if is_final || next_node == Some(NodeTag::End) {
        let output = obj
            .get("output")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("terminal decision without output"))?;
        return Ok(ClassificationResult::terminal(output));
    }

    let node = next_node.ok_or_else(|| malformed("missing next_node"))?;
    let input = obj
        .get("inputs")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("inputs is not a string"))?;

    ClassificationResult::dispatch(node, input)
}

/// Accept the loose spellings models use for booleans
fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
