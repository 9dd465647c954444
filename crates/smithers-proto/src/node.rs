//! Snapshot tree model.
//!
//! A `Node` is a value object: the tree builder produces a fresh tree every
//! frame and nothing about a node survives between frames except its path.
//! All mutable execution status is stored elsewhere, keyed by that path (or by
//! an explicit `key` when the caller generates lists dynamically).

use crate::interfaces::{ExecutionOutput, HumanDecision};
use crate::{NodeExecutionError, RetryPolicy, StateMutation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A handler invoked on the loop thread when a node settles.
///
/// Handlers never touch application state directly; they return the state
/// mutations the loop applies through the store before the next render.
pub type Reducer<T> = Arc<dyn Fn(&T) -> Vec<StateMutation> + Send + Sync>;

/// Props for an executable (LLM) node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentProps {
    /// Prompt sent to the executor. Text children are appended to it.
    #[serde(default)]
    pub prompt: String,

    /// Model selector passed through to the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Maximum conversation turns, if the executor supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,

    /// Per-dispatch timeout, enforced by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Retry policy for tool calls made during this node's execution.
    /// Falls back to the run-wide policy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Props for a phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseProps {
    pub name: String,
    #[serde(default)]
    pub skip_if: bool,
}

/// Props for a step within a phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepProps {
    pub name: String,
    #[serde(default)]
    pub skip_if: bool,
}

/// Props for a subagent group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub parallel: bool,
}

/// Props for a human approval gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanProps {
    pub message: String,
    #[serde(default = "default_human_kind")]
    pub kind: String,
}

fn default_human_kind() -> String {
    "approval".to_string()
}

/// Props for a stop signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Props for a Ralph iteration container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RalphProps {
    pub id: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Set by the builder once the loop's exit condition holds.
    #[serde(default)]
    pub done: bool,
}

fn default_max_iterations() -> u32 {
    10
}

/// Node discriminator with the typed props for each kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Executable unit: dispatched to the executor.
    Claude(AgentProps),
    Phase(PhaseProps),
    Step(StepProps),
    Subagent(SubagentProps),
    /// Dedicated parallel group.
    Parallel,
    Human(HumanProps),
    Stop(StopProps),
    Ralph(RalphProps),
    /// Plain grouping with no scheduling semantics of its own.
    Group,
    Text { content: String },
}

impl NodeKind {
    /// Returns the type name used in paths and debug events.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Claude(_) => "claude",
            NodeKind::Phase(_) => "phase",
            NodeKind::Step(_) => "step",
            NodeKind::Subagent(_) => "subagent",
            NodeKind::Parallel => "parallel",
            NodeKind::Human(_) => "human",
            NodeKind::Stop(_) => "stop",
            NodeKind::Ralph(_) => "ralph",
            NodeKind::Group => "group",
            NodeKind::Text { .. } => "text",
        }
    }

    /// Returns true for node kinds dispatched to the executor.
    pub fn is_executable(&self) -> bool {
        matches!(self, NodeKind::Claude(_))
    }

    /// Returns true for control-flow kinds, which carry no content hash.
    pub fn is_control(&self) -> bool {
        matches!(self, NodeKind::Stop(_) | NodeKind::Human(_))
    }
}

/// Reducer handlers attached to a node.
#[derive(Clone, Default)]
pub struct Handlers {
    pub on_finished: Option<Reducer<ExecutionOutput>>,
    pub on_error: Option<Reducer<NodeExecutionError>>,
    pub on_approve: Option<Reducer<HumanDecision>>,
    pub on_reject: Option<Reducer<HumanDecision>>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_finished", &self.on_finished.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_approve", &self.on_approve.is_some())
            .field("on_reject", &self.on_reject.is_some())
            .finish()
    }
}

/// One immutable element of a rendered tree snapshot.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Explicit stable id, used instead of the path as the persistence key.
    pub key: Option<String>,
    /// Unknown props, kept for forward compatibility. Part of the content hash.
    pub extra: BTreeMap<String, Value>,
    pub children: Vec<Node>,
    pub handlers: Handlers,
}

impl Node {
    /// Creates a node of the given kind with no children.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            key: None,
            extra: BTreeMap::new(),
            children: Vec::new(),
            handlers: Handlers::default(),
        }
    }

    /// Creates an executable node with the given prompt.
    pub fn claude(prompt: impl Into<String>) -> Self {
        Self::new(NodeKind::Claude(AgentProps {
            prompt: prompt.into(),
            ..AgentProps::default()
        }))
    }

    pub fn phase(name: impl Into<String>) -> Self {
        Self::new(NodeKind::Phase(PhaseProps {
            name: name.into(),
            skip_if: false,
        }))
    }

    pub fn step(name: impl Into<String>) -> Self {
        Self::new(NodeKind::Step(StepProps {
            name: name.into(),
            skip_if: false,
        }))
    }

    /// Creates a subagent group. `parallel = false` runs children one at a time.
    pub fn subagent(parallel: bool) -> Self {
        Self::new(NodeKind::Subagent(SubagentProps {
            name: None,
            parallel,
        }))
    }

    pub fn parallel() -> Self {
        Self::new(NodeKind::Parallel)
    }

    pub fn human(message: impl Into<String>) -> Self {
        Self::new(NodeKind::Human(HumanProps {
            message: message.into(),
            kind: default_human_kind(),
        }))
    }

    pub fn stop(reason: Option<&str>) -> Self {
        Self::new(NodeKind::Stop(StopProps {
            reason: reason.map(str::to_string),
        }))
    }

    pub fn ralph(id: impl Into<String>, max_iterations: u32) -> Self {
        Self::new(NodeKind::Ralph(RalphProps {
            id: id.into(),
            max_iterations,
            done: false,
        }))
    }

    pub fn group() -> Self {
        Self::new(NodeKind::Group)
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(NodeKind::Text {
            content: content.into(),
        })
    }

    /// Returns the type name of this node.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Sets the explicit stable id.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets an untyped prop.
    pub fn with_prop(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Appends a child.
    pub fn child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    /// Appends several children in order.
    pub fn children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }

    /// Sets the model on an executable node. No-op for other kinds.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        if let NodeKind::Claude(props) = &mut self.kind {
            props.model = Some(model.into());
        }
        self
    }

    /// Sets the tool retry policy on an executable node. No-op for other kinds.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        if let NodeKind::Claude(props) = &mut self.kind {
            props.retry = Some(policy);
        }
        self
    }

    /// Sets the dispatch timeout on an executable node. No-op for other kinds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let NodeKind::Claude(props) = &mut self.kind {
            props.timeout_ms = Some(timeout_ms);
        }
        self
    }

    /// Sets `skip_if` on a phase or step. No-op for other kinds.
    pub fn skip_if(mut self, skip: bool) -> Self {
        match &mut self.kind {
            NodeKind::Phase(props) => props.skip_if = skip,
            NodeKind::Step(props) => props.skip_if = skip,
            _ => {}
        }
        self
    }

    /// Marks a Ralph loop's exit condition. No-op for other kinds.
    pub fn done(mut self, done: bool) -> Self {
        if let NodeKind::Ralph(props) = &mut self.kind {
            props.done = done;
        }
        self
    }

    pub fn on_finished<F>(mut self, reducer: F) -> Self
    where
        F: Fn(&ExecutionOutput) -> Vec<StateMutation> + Send + Sync + 'static,
    {
        self.handlers.on_finished = Some(Arc::new(reducer));
        self
    }

    pub fn on_error<F>(mut self, reducer: F) -> Self
    where
        F: Fn(&NodeExecutionError) -> Vec<StateMutation> + Send + Sync + 'static,
    {
        self.handlers.on_error = Some(Arc::new(reducer));
        self
    }

    pub fn on_approve<F>(mut self, reducer: F) -> Self
    where
        F: Fn(&HumanDecision) -> Vec<StateMutation> + Send + Sync + 'static,
    {
        self.handlers.on_approve = Some(Arc::new(reducer));
        self
    }

    pub fn on_reject<F>(mut self, reducer: F) -> Self
    where
        F: Fn(&HumanDecision) -> Vec<StateMutation> + Send + Sync + 'static,
    {
        self.handlers.on_reject = Some(Arc::new(reducer));
        self
    }

    /// Concatenated text of all descendant text leaves, in document order.
    pub fn descendant_text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }

    /// Counts this node and all of its descendants.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Node::count).sum::<usize>()
    }
}

fn collect_text(node: &Node, out: &mut String) {
    for child in &node.children {
        if let NodeKind::Text { content } = &child.kind {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(content);
        } else {
            collect_text(child, out);
        }
    }
}

/// Builds the path of a child from its parent's path.
///
/// `index` counts siblings of the same type only, so inserting a node of a
/// different type does not shift the paths of its neighbours.
pub fn child_path(parent: &str, type_name: &str, index: usize) -> String {
    if parent.is_empty() {
        format!("{type_name}[{index}]")
    } else {
        format!("{parent}/{type_name}[{index}]")
    }
}

/// Path prefix for the body of a Ralph loop during one iteration.
pub fn iteration_path(ralph_path: &str, iteration: u32) -> String {
    format!("{ralph_path}/iter[{iteration}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_path_counts_same_type_only() {
        assert_eq!(child_path("", "group", 0), "group[0]");
        assert_eq!(child_path("group[0]", "phase", 1), "group[0]/phase[1]");
        assert_eq!(
            iteration_path("group[0]/ralph[0]", 2),
            "group[0]/ralph[0]/iter[2]"
        );
    }

    #[test]
    fn test_builder_sets_typed_props() {
        let node = Node::claude("Summarize")
            .with_model("sonnet")
            .with_timeout_ms(1_000)
            .with_key("summary");

        match &node.kind {
            NodeKind::Claude(props) => {
                assert_eq!(props.prompt, "Summarize");
                assert_eq!(props.model.as_deref(), Some("sonnet"));
                assert_eq!(props.timeout_ms, Some(1_000));
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(node.key.as_deref(), Some("summary"));
        assert_eq!(node.type_name(), "claude");
    }

    #[test]
    fn test_skip_if_ignored_for_non_sequencing_nodes() {
        let phase = Node::phase("review").skip_if(true);
        assert!(matches!(phase.kind, NodeKind::Phase(PhaseProps { skip_if: true, .. })));

        let claude = Node::claude("x").skip_if(true);
        assert_eq!(claude.kind, NodeKind::Claude(AgentProps {
            prompt: "x".to_string(),
            ..AgentProps::default()
        }));
    }

    #[test]
    fn test_descendant_text_in_document_order() {
        let node = Node::claude("")
            .child(Node::text("first"))
            .child(Node::group().child(Node::text("second")));
        assert_eq!(node.descendant_text(), "first\nsecond");
        assert_eq!(node.count(), 4);
    }

    #[test]
    fn test_kind_serializes_with_type_tag() {
        let kind = NodeKind::Stop(StopProps {
            reason: Some("done".to_string()),
        });
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "stop");
        assert_eq!(json["reason"], "done");

        let parsed: NodeKind = serde_json::from_value(serde_json::json!({
            "type": "human",
            "message": "Ship it?"
        }))
        .unwrap();
        assert_eq!(
            parsed,
            NodeKind::Human(HumanProps {
                message: "Ship it?".to_string(),
                kind: "approval".to_string(),
            })
        );
    }

    #[test]
    fn test_control_kinds() {
        assert!(Node::stop(None).kind.is_control());
        assert!(Node::human("ok?").kind.is_control());
        assert!(!Node::claude("go").kind.is_control());
        assert!(Node::claude("go").kind.is_executable());
    }
}
