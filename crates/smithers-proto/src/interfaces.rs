//! Narrow interfaces to the engine's external collaborators.

use crate::{Node, Result, ToolRunner};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Read-only view of key/value state.
pub trait StateView: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
}

/// Frozen inputs handed to the tree builder for one render.
pub struct RenderContext<'a> {
    pub execution_id: &'a str,
    pub frame: u32,
    state: &'a dyn StateView,
}

impl<'a> RenderContext<'a> {
    pub fn new(execution_id: &'a str, frame: u32, state: &'a dyn StateView) -> Self {
        Self {
            execution_id,
            frame,
            state,
        }
    }

    /// Returns the raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.get(key)
    }

    /// Returns the value under `key` decoded as `T`, or `None` if absent or of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Returns true if `key` holds boolean `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.get_as::<bool>(key).unwrap_or(false)
    }
}

/// Produces the snapshot tree for a frame.
///
/// Must be a pure function of the render context; side effects belong in
/// node handlers.
pub trait TreeBuilder: Send + Sync {
    fn build(&self, ctx: &RenderContext<'_>) -> Node;
}

impl<F> TreeBuilder for F
where
    F: Fn(&RenderContext<'_>) -> Node + Send + Sync,
{
    fn build(&self, ctx: &RenderContext<'_>) -> Node {
        self(ctx)
    }
}

/// Everything an executor needs to run one executable node.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub path: String,
    pub node_type: String,
    /// Prompt with text children and injected messages already resolved.
    pub prompt: String,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout: Option<Duration>,
    /// Ralph iteration the node belongs to (0 outside any loop).
    pub iteration: u32,
    /// Tool runner wrapped in the node's retry policy, if tools are configured.
    pub tools: Option<Arc<dyn ToolRunner>>,
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("execution_id", &self.execution_id)
            .field("path", &self.path)
            .field("node_type", &self.node_type)
            .field("prompt", &self.prompt)
            .field("model", &self.model)
            .field("max_turns", &self.max_turns)
            .field("timeout", &self.timeout)
            .field("iteration", &self.iteration)
            .field("tools", &self.tools.is_some())
            .finish()
    }
}

/// Output of a successful executor call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl ExecutionOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }
}

/// Runs executable nodes (an LLM call, a process, ...).
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput>;
}

/// A pending human gate, as presented to an approval handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPrompt {
    pub request_id: String,
    pub path: String,
    pub kind: String,
    pub message: String,
}

/// The resolution of a human gate, passed to its approve/reject handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanDecision {
    pub request_id: String,
    pub message: String,
    pub approved: bool,
}

/// Decides human gates. Returning `true` approves.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn decide(&self, prompt: &ApprovalPrompt) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapView(HashMap<String, Value>);

    impl StateView for MapView {
        fn get(&self, key: &str) -> Option<Value> {
            self.0.get(key).cloned()
        }
    }

    #[test]
    fn test_render_context_typed_reads() {
        let mut map = HashMap::new();
        map.insert("approved".to_string(), Value::Bool(true));
        map.insert("count".to_string(), serde_json::json!(3));
        let view = MapView(map);
        let ctx = RenderContext::new("exec-1", 2, &view);

        assert!(ctx.flag("approved"));
        assert!(!ctx.flag("missing"));
        assert_eq!(ctx.get_as::<u32>("count"), Some(3));
        assert_eq!(ctx.get_as::<String>("count"), None);
        assert_eq!(ctx.frame, 2);
    }

    #[test]
    fn test_closure_is_tree_builder() {
        let builder = |ctx: &RenderContext<'_>| {
            if ctx.flag("done") {
                Node::stop(Some("done"))
            } else {
                Node::claude("work")
            }
        };
        let view = MapView(HashMap::new());
        let tree = builder.build(&RenderContext::new("exec-1", 1, &view));
        assert_eq!(tree.type_name(), "claude");
    }
}
