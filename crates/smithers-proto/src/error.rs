//! Error taxonomy shared by every Smithers crate.

use serde::{Deserialize, Serialize};

/// A node's executor call failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("node {node_type} at {node_path} failed: {message}")]
pub struct NodeExecutionError {
    pub message: String,
    pub node_type: String,
    pub node_path: String,
    /// The resolved prompt the node was dispatched with.
    pub input: String,
}

/// A tool call failed, possibly after retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("tool '{tool}' failed after {attempts} attempt(s): {message}")]
pub struct ToolExecutionError {
    pub tool: String,
    pub message: String,
    pub attempts: u32,
}

impl ToolExecutionError {
    /// Creates an error for a single failed attempt.
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
            attempts: 1,
        }
    }
}

/// A persisted value could not be read back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("corrupt state at line {line}: {detail}")]
pub struct CorruptStateError {
    /// 1-indexed journal line, or 0 when the value did not come from a journal.
    pub line: u64,
    pub detail: String,
}

/// Errors surfaced by the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    NodeExecution(#[from] NodeExecutionError),

    #[error(transparent)]
    ToolExecution(#[from] ToolExecutionError),

    #[error(transparent)]
    CorruptState(#[from] CorruptStateError),

    /// Explicit abort or Stop node. A normal terminal state, not a failure.
    #[error("loop aborted: {reason}")]
    LoopAborted { reason: String },

    #[error("max frames exceeded after {frames} frames")]
    MaxFramesExceeded { frames: u32 },

    /// Failure reported by an executor that is not a tool failure.
    #[error("executor error: {0}")]
    Executor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal encode error: {0}")]
    Journal(#[from] serde_json::Error),
}

/// Result type for Smithers operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_display_includes_path() {
        let err = NodeExecutionError {
            message: "rate limited".to_string(),
            node_type: "claude".to_string(),
            node_path: "group[0]/claude[1]".to_string(),
            input: "Write tests".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "node claude at group[0]/claude[1] failed: rate limited"
        );
    }

    #[test]
    fn test_tool_error_converts_into_error() {
        let err: Error = ToolExecutionError::new("shell", "exit 1").into();
        assert!(matches!(err, Error::ToolExecution(_)));
        assert_eq!(
            err.to_string(),
            "tool 'shell' failed after 1 attempt(s): exit 1"
        );
    }
}
