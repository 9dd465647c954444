//! YAML workflow files.
//!
//! A workflow declares a static node tree plus the executor command. Nodes
//! read state through conditions (`skip_if`, `done`, `when`), `{{key}}`
//! prompt placeholders, and write it back through `output_key`,
//! `error_key`, and `approved_key`.
//!
//! ```yaml
//! name: ship-feature
//! executor:
//!   command: claude
//!   prompt_flag: "-p"
//! nodes:
//!   - type: phase
//!     name: plan
//!     children:
//!       - type: claude
//!         prompt: Plan the change
//!         output_key: plan
//!   - type: phase
//!     name: implement
//!     children:
//!       - type: claude
//!         prompt: "Implement this plan: {{plan}}"
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use smithers_adapters::CliBackend;
use smithers_proto::{
    AgentProps, Node, NodeKind, RenderContext, RetryPolicy, StateMutation, SubagentProps,
};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    #[serde(default)]
    pub name: Option<String>,
    /// Command each executable node runs through. Defaults to the Claude CLI.
    #[serde(default)]
    pub executor: Option<CliBackend>,
    pub nodes: Vec<NodeSpec>,
}

/// A boolean literal, a state key, or a negated state key (`!key`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Literal(bool),
    Key(String),
}

impl Condition {
    pub fn eval(&self, ctx: &RenderContext<'_>) -> bool {
        match self {
            Condition::Literal(value) => *value,
            Condition::Key(key) => match key.strip_prefix('!') {
                Some(negated) => !ctx.flag(negated.trim()),
                None => ctx.flag(key.trim()),
            },
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Condition::Literal(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum NodeSpec {
    Claude {
        prompt: String,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        max_turns: Option<u32>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        retry: Option<RetryPolicy>,
        /// State key that receives the node's output.
        #[serde(default)]
        output_key: Option<String>,
        /// State key that receives the error message. Setting it makes the
        /// failure non-fatal.
        #[serde(default)]
        error_key: Option<String>,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
    Phase {
        name: String,
        #[serde(default)]
        skip_if: Condition,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
    Step {
        name: String,
        #[serde(default)]
        skip_if: Condition,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
    Subagent {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        parallel: bool,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
    Parallel {
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
    Human {
        message: String,
        #[serde(default)]
        key: Option<String>,
        /// State key set to `true` on approval and `false` on rejection.
        #[serde(default)]
        approved_key: Option<String>,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
    Stop {
        #[serde(default)]
        reason: Option<String>,
        /// Rendered only while this holds. Always rendered when absent.
        #[serde(default)]
        when: Option<Condition>,
    },
    Ralph {
        id: String,
        max_iterations: u32,
        #[serde(default)]
        done: Condition,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
    Text {
        content: String,
    },
}

impl Workflow {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow {}", path.display()))?;
        let workflow = Self::from_yaml(&content)
            .with_context(|| format!("Invalid workflow {}", path.display()))?;
        debug!(path = %path.display(), name = ?workflow.name, nodes = workflow.nodes.len(), "Workflow loaded");
        Ok(workflow)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let workflow: Self = serde_yaml::from_str(content)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Rejects trees the scheduler cannot address unambiguously.
    fn validate(&self) -> Result<()> {
        let mut ralph_ids = HashSet::new();
        let mut phase_names = HashSet::new();
        let mut keys = HashSet::new();
        let mut stack: Vec<&NodeSpec> = self.nodes.iter().collect();

        while let Some(spec) = stack.pop() {
            match spec {
                NodeSpec::Ralph {
                    id, max_iterations, ..
                } => {
                    if !ralph_ids.insert(id.as_str()) {
                        bail!("duplicate ralph id '{id}'");
                    }
                    if *max_iterations == 0 {
                        bail!("ralph '{id}' needs max_iterations of at least 1");
                    }
                }
                NodeSpec::Phase { name, .. } => {
                    if !phase_names.insert(name.as_str()) {
                        bail!("duplicate phase name '{name}'");
                    }
                }
                NodeSpec::Claude { key: Some(key), .. } | NodeSpec::Human { key: Some(key), .. } => {
                    if !keys.insert(key.as_str()) {
                        bail!("duplicate node key '{key}'");
                    }
                }
                _ => {}
            }
            stack.extend(spec.children());
        }
        Ok(())
    }

    /// Renders the tree for one frame.
    pub fn render(&self, ctx: &RenderContext<'_>) -> Node {
        Node::group().children(self.nodes.iter().filter_map(|spec| spec.render(ctx)))
    }
}

impl NodeSpec {
    fn children(&self) -> &[NodeSpec] {
        match self {
            NodeSpec::Claude { children, .. }
            | NodeSpec::Phase { children, .. }
            | NodeSpec::Step { children, .. }
            | NodeSpec::Subagent { children, .. }
            | NodeSpec::Parallel { children }
            | NodeSpec::Human { children, .. }
            | NodeSpec::Ralph { children, .. } => children,
            NodeSpec::Stop { .. } | NodeSpec::Text { .. } => &[],
        }
    }

    fn render_children(&self, ctx: &RenderContext<'_>) -> Vec<Node> {
        self.children()
            .iter()
            .filter_map(|child| child.render(ctx))
            .collect()
    }

    /// Returns `None` for a Stop whose condition does not hold.
    fn render(&self, ctx: &RenderContext<'_>) -> Option<Node> {
        let node = match self {
            NodeSpec::Claude {
                prompt,
                key,
                model,
                max_turns,
                timeout_ms,
                retry,
                output_key,
                error_key,
                ..
            } => {
                let mut node = Node::new(NodeKind::Claude(AgentProps {
                    prompt: interpolate(prompt, ctx),
                    model: model.clone(),
                    max_turns: *max_turns,
                    timeout_ms: *timeout_ms,
                    retry: retry.clone(),
                }));
                if let Some(key) = key {
                    node = node.with_key(key);
                }
                if let Some(output_key) = output_key.clone() {
                    node = node.on_finished(move |out| {
                        vec![StateMutation::set(output_key.clone(), &out.output)]
                    });
                }
                if let Some(error_key) = error_key.clone() {
                    node = node.on_error(move |err| {
                        vec![StateMutation::set(error_key.clone(), &err.message)]
                    });
                }
                node
            }
            NodeSpec::Phase { name, skip_if, .. } => Node::phase(name).skip_if(skip_if.eval(ctx)),
            NodeSpec::Step { name, skip_if, .. } => Node::step(name).skip_if(skip_if.eval(ctx)),
            NodeSpec::Subagent { name, parallel, .. } => {
                Node::new(NodeKind::Subagent(SubagentProps {
                    name: name.clone(),
                    parallel: *parallel,
                }))
            }
            NodeSpec::Parallel { .. } => Node::parallel(),
            NodeSpec::Human {
                message,
                key,
                approved_key,
                ..
            } => {
                let mut node = Node::human(interpolate(message, ctx));
                if let Some(key) = key {
                    node = node.with_key(key);
                }
                if let Some(approved_key) = approved_key.clone() {
                    let reject_key = approved_key.clone();
                    node = node
                        .on_approve(move |_| vec![StateMutation::set(approved_key.clone(), true)])
                        .on_reject(move |_| vec![StateMutation::set(reject_key.clone(), false)]);
                }
                node
            }
            NodeSpec::Stop { reason, when } => {
                if when.as_ref().is_some_and(|c| !c.eval(ctx)) {
                    return None;
                }
                Node::stop(reason.as_deref())
            }
            NodeSpec::Ralph {
                id,
                max_iterations,
                done,
                ..
            } => Node::ralph(id, *max_iterations).done(done.eval(ctx)),
            NodeSpec::Text { content } => Node::text(interpolate(content, ctx)),
        };
        Some(node.children(self.render_children(ctx)))
    }
}

/// Replaces `{{key}}` with the state value under `key`. Strings are
/// inserted raw, other values as JSON, missing keys as empty text.
fn interpolate(template: &str, ctx: &RenderContext<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = rest[start + 2..start + 2 + len].trim();
        match ctx.get(key) {
            Some(Value::String(s)) => out.push_str(&s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use smithers_proto::StateView;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapView(HashMap<String, Value>);

    impl StateView for MapView {
        fn get(&self, key: &str) -> Option<Value> {
            self.0.get(key).cloned()
        }
    }

    const WORKFLOW: &str = r#"
name: ship-feature
executor:
  command: echo
nodes:
  - type: phase
    name: plan
    children:
      - type: claude
        prompt: Plan the change
        key: plan-node
        model: opus
        output_key: plan
  - type: phase
    name: implement
    skip_if: "!plan_approved"
    children:
      - type: claude
        prompt: "Implement: {{plan}}"
        children:
          - type: text
            content: Run the tests too.
  - type: stop
    reason: budget exhausted
    when: over_budget
"#;

    fn render(workflow: &Workflow, view: &MapView) -> Node {
        workflow.render(&RenderContext::new("exec-1", 1, view))
    }

    #[test]
    fn test_parse_and_render() {
        let workflow = Workflow::from_yaml(WORKFLOW).unwrap();
        assert_eq!(workflow.name.as_deref(), Some("ship-feature"));
        assert_eq!(workflow.executor.as_ref().unwrap().command, "echo");

        let tree = render(&workflow, &MapView::default());
        assert_eq!(tree.type_name(), "group");
        // The stop node is not rendered while its condition is false.
        assert_eq!(tree.children.len(), 2);

        let plan = &tree.children[0].children[0];
        assert_eq!(plan.key.as_deref(), Some("plan-node"));
        match &plan.kind {
            NodeKind::Claude(props) => {
                assert_eq!(props.prompt, "Plan the change");
                assert_eq!(props.model.as_deref(), Some("opus"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert!(plan.handlers.on_finished.is_some());

        match &tree.children[1].kind {
            NodeKind::Phase(props) => assert!(props.skip_if),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_state_flows_into_render() {
        let workflow = Workflow::from_yaml(WORKFLOW).unwrap();
        let mut view = MapView::default();
        view.0.insert("plan".to_string(), Value::from("add a cache"));
        view.0.insert("plan_approved".to_string(), Value::Bool(true));
        view.0.insert("over_budget".to_string(), Value::Bool(true));

        let tree = render(&workflow, &view);
        assert_eq!(tree.children.len(), 3);
        match &tree.children[1].kind {
            NodeKind::Phase(props) => assert!(!props.skip_if),
            other => panic!("unexpected kind: {other:?}"),
        }
        let implement = &tree.children[1].children[0];
        match &implement.kind {
            NodeKind::Claude(props) => assert_eq!(props.prompt, "Implement: add a cache"),
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(implement.descendant_text(), "Run the tests too.");
        assert_eq!(tree.children[2].type_name(), "stop");
    }

    #[test]
    fn test_output_key_reducer() {
        let workflow = Workflow::from_yaml(WORKFLOW).unwrap();
        let tree = render(&workflow, &MapView::default());
        let on_finished = tree.children[0].children[0]
            .handlers
            .on_finished
            .clone()
            .unwrap();

        let mutations = on_finished(&smithers_proto::ExecutionOutput::text("the plan"));
        assert_eq!(mutations, vec![StateMutation::set("plan", "the plan")]);
    }

    #[test]
    fn test_interpolate() {
        let mut view = MapView::default();
        view.0.insert("n".to_string(), Value::from(3));
        let ctx = RenderContext::new("exec-1", 1, &view);

        assert_eq!(interpolate("try {{ n }} times", &ctx), "try 3 times");
        assert_eq!(interpolate("missing: [{{nope}}]", &ctx), "missing: []");
        assert_eq!(interpolate("unclosed {{n", &ctx), "unclosed {{n");
    }

    #[test]
    fn test_ralph_done_condition() {
        let yaml = r"
nodes:
  - type: ralph
    id: fix
    max_iterations: 3
    done: tests_pass
    children:
      - type: claude
        prompt: Fix the failing tests
";
        let workflow = Workflow::from_yaml(yaml).unwrap();
        let mut view = MapView::default();
        view.0.insert("tests_pass".to_string(), Value::Bool(true));

        let tree = render(&workflow, &view);
        match &tree.children[0].kind {
            NodeKind::Ralph(props) => {
                assert_eq!(props.id, "fix");
                assert_eq!(props.max_iterations, 3);
                assert!(props.done);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_validation_errors() {
        let duplicate_phase = r"
nodes:
  - type: phase
    name: a
  - type: phase
    name: a
";
        let err = Workflow::from_yaml(duplicate_phase).unwrap_err();
        assert_eq!(err.to_string(), "duplicate phase name 'a'");

        let zero_iterations = r"
nodes:
  - type: ralph
    id: r
    max_iterations: 0
";
        assert!(Workflow::from_yaml(zero_iterations).is_err());

        let unknown_type = r"
nodes:
  - type: webhook
";
        assert!(Workflow::from_yaml(unknown_type).is_err());
    }
}
