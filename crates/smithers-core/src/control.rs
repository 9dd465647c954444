//! Control-flow collaborators: approval handlers and tree inspection.

use crate::scheduler::{child_paths, ralph_iteration_key, root_path};
use crate::store::StateStore;
use async_trait::async_trait;
use smithers_proto::{ApprovalHandler, ApprovalPrompt, Node, NodeKind, iteration_path};
use std::fmt::Write;
use tracing::info;

/// Approves every gate. Used when no approval callback is registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn decide(&self, prompt: &ApprovalPrompt) -> bool {
        info!(request_id = %prompt.request_id, "Auto-approving human request");
        true
    }
}

/// Rejects every gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoReject;

#[async_trait]
impl ApprovalHandler for AutoReject {
    async fn decide(&self, prompt: &ApprovalPrompt) -> bool {
        info!(request_id = %prompt.request_id, "Auto-rejecting human request");
        false
    }
}

/// Renders a tree as indented text annotated with execution status.
///
/// Without `full`, text leaves and prompts are omitted.
pub fn format_tree(root: &Node, store: &StateStore, full: bool) -> String {
    let mut out = String::new();
    write_node(&mut out, root, &root_path(root), None, store, full, 0);
    out
}

fn write_node(
    out: &mut String,
    node: &Node,
    path: &str,
    iter_prefix: Option<&str>,
    store: &StateStore,
    full: bool,
    depth: usize,
) {
    if let NodeKind::Text { content } = &node.kind {
        if full {
            let _ = writeln!(out, "{:indent$}\"{content}\"", "", indent = depth * 2);
        }
        return;
    }

    let id = match (&node.key, iter_prefix) {
        (Some(key), Some(prefix)) => format!("{prefix}/{key}"),
        (Some(key), None) => key.clone(),
        (None, _) => path.to_string(),
    };
    let mut line = format!("{:indent$}{}", "", node.type_name(), indent = depth * 2);
    match &node.kind {
        NodeKind::Phase(props) => {
            let status = store.phase(&props.name).map_or("pending", |p| p.status.as_str());
            let _ = write!(line, " \"{}\" [{status}]", props.name);
        }
        NodeKind::Step(props) => {
            let _ = write!(line, " \"{}\"", props.name);
        }
        NodeKind::Claude(props) => {
            let status = store.execution(&id).map_or("pending", |r| r.status.as_str());
            let _ = write!(line, " {path} [{status}]");
            if full && !props.prompt.is_empty() {
                let _ = write!(line, " prompt={:?}", props.prompt);
            }
        }
        NodeKind::Human(props) => {
            let status = store.human_request(&id).map_or("unregistered", |r| r.status.as_str());
            let _ = write!(line, " {id} [{status}] {:?}", props.message);
        }
        NodeKind::Stop(props) => {
            if let Some(reason) = &props.reason {
                let _ = write!(line, " {reason:?}");
            }
        }
        NodeKind::Ralph(props) => {
            let _ = write!(line, " \"{}\" (max {})", props.id, props.max_iterations);
        }
        _ => {}
    }
    out.push_str(&line);
    out.push('\n');

    let (base, prefix) = match &node.kind {
        NodeKind::Ralph(props) => {
            let iteration = store
                .get_as::<u32>(&ralph_iteration_key(&props.id))
                .ok()
                .flatten()
                .unwrap_or(0);
            let base = iteration_path(path, iteration);
            (base.clone(), Some(base))
        }
        _ => (path.to_string(), iter_prefix.map(str::to_string)),
    };
    for (child, child_path) in node.children.iter().zip(child_paths(&base, &node.children)) {
        write_node(out, child, &child_path, prefix.as_deref(), store, full, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExecutionRecord, ExecutionStatus};

    #[tokio::test]
    async fn test_auto_handlers() {
        let prompt = ApprovalPrompt {
            request_id: "human[0]".to_string(),
            path: "human[0]".to_string(),
            kind: "approval".to_string(),
            message: "Ship it?".to_string(),
        };
        assert!(AutoApprove.decide(&prompt).await);
        assert!(!AutoReject.decide(&prompt).await);
    }

    #[test]
    fn test_format_tree_shows_status() {
        let store = StateStore::in_memory("exec-1");
        let mut record = ExecutionRecord::new("group[0]/claude[0]", "group[0]/claude[0]", "claude");
        record.status = ExecutionStatus::Complete;
        store.upsert_execution(record).unwrap();

        let tree = Node::group().children([
            Node::claude("A").child(Node::text("context")),
            Node::claude("B"),
        ]);
        let short = format_tree(&tree, &store, false);
        assert_eq!(
            short,
            "group\n  claude group[0]/claude[0] [complete]\n  claude group[0]/claude[1] [pending]\n"
        );

        let full = format_tree(&tree, &store, true);
        assert!(full.contains("prompt=\"A\""));
        assert!(full.contains("\"context\""));
    }
}
