//! Tool-call interface and retry policy.

use crate::ToolExecutionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delay growth between tool-call retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    #[default]
    Linear,
    Exponential,
}

/// Retry policy applied to tool calls made during a node's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,

    /// Record an exhausted tool failure as an error result instead of
    /// failing the enclosing node.
    #[serde(default)]
    pub continue_on_tool_failure: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff: Backoff::default(),
            continue_on_tool_failure: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries and never swallows failures.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            backoff: Backoff::Fixed,
            continue_on_tool_failure: false,
        }
    }
}

/// Result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: Value,
    /// True when the call failed but the policy let the node continue.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Runs named tools on behalf of an executor.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run_tool(&self, name: &str, input: &Value) -> Result<ToolResult, ToolExecutionError>;
}
