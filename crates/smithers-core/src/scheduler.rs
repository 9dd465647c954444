//! Scheduler primitives and the per-frame eligibility scan.
//!
//! The scan walks a freshly rendered tree in document order and decides, for
//! every subtree, whether it is done or still has outstanding work. Along the
//! way it advances the persisted phase and step cursors, iterates Ralph
//! loops, and collects the executable nodes and human gates that are ready.
//!
//! Containers are sequential unless they are a `parallel` node or a subagent
//! with `parallel = true`: a sequential container stops at its first child
//! that is not done, a parallel one visits every child.

use crate::hash::content_hash;
use crate::store::{ExecutionStatus, HumanStatus, PhaseStatus, StateStore};
use smithers_proto::{
    DebugEvent, Handlers, HumanProps, Node, NodeKind, PhaseProps, RalphProps, Result, StepProps,
    SubagentProps, child_path, iteration_path,
};
use std::collections::HashMap;
use tracing::{debug, info};

/// State key holding the index of the active phase.
pub const PHASE_CURSOR_KEY: &str = "currentPhaseIndex";

/// State key set once every registered phase has completed.
pub const PHASES_COMPLETE_KEY: &str = "allPhasesComplete";

const ROOT_SCOPE: &str = "root";
const WRITER: &str = "scheduler";

/// State key holding the active step index within a phase (or `root`).
pub fn step_cursor_key(scope: &str) -> String {
    format!("stepIndex_{scope}")
}

/// State key holding a Ralph loop's current iteration.
pub fn ralph_iteration_key(id: &str) -> String {
    format!("ralphIteration_{id}")
}

/// An executable node that is ready to dispatch.
#[derive(Debug, Clone)]
pub struct EligibleNode {
    /// Persistence key of the node's execution record.
    pub id: String,
    pub path: String,
    pub node: Node,
    pub content_hash: String,
    pub iteration: u32,
}

/// A human gate that has not been resolved yet.
#[derive(Debug, Clone)]
pub struct PendingGate {
    /// Request id: the gate's path, or its explicit key.
    pub id: String,
    pub path: String,
    pub props: HumanProps,
    pub handlers: Handlers,
    pub iteration: u32,
}

/// A reachable Stop node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSignal {
    pub path: String,
    pub reason: Option<String>,
}

/// Everything one scan found.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Ready executable nodes, in document order.
    pub eligible: Vec<EligibleNode>,
    /// Unresolved human gates, in document order.
    pub gates: Vec<PendingGate>,
    pub stop: Option<StopSignal>,
    /// Phase transitions made by this scan, to be emitted by the caller.
    pub events: Vec<DebugEvent>,
    /// True on the one scan that advanced past the last phase.
    pub all_phases_complete: bool,
    /// True when the whole tree is done.
    pub tree_done: bool,
    pub node_count: usize,
}

/// Phase names in the order first encountered.
///
/// Phases nested inside another phase are not registered; they behave as
/// plain groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseRegistry {
    names: Vec<String>,
}

impl PhaseRegistry {
    pub fn from_tree(root: &Node) -> Self {
        let mut names = Vec::new();
        collect_phases(std::slice::from_ref(root), &mut names);
        Self { names }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

fn collect_phases(nodes: &[Node], out: &mut Vec<String>) {
    for node in nodes {
        match &node.kind {
            NodeKind::Phase(props) => {
                if !out.contains(&props.name) {
                    out.push(props.name.clone());
                }
            }
            NodeKind::Claude(_) | NodeKind::Text { .. } => {}
            _ => collect_phases(&node.children, out),
        }
    }
}

#[derive(Debug, Clone)]
struct StepSlot {
    scope: String,
    ordinal: usize,
}

/// Step ordinals per cursor scope, assigned in document order over the whole
/// tree.
///
/// A step keeps its ordinal while it is hidden behind a pending sibling, so
/// a later step in another branch can never claim its place in the sequence.
/// Slots are keyed by path with Ralph iteration segments removed; every
/// iteration of a body shares the same ordinals.
#[derive(Debug, Clone, Default)]
struct StepRegistry {
    slots: HashMap<String, StepSlot>,
}

impl StepRegistry {
    fn from_tree(root: &Node) -> Self {
        let mut registry = Self::default();
        let mut counters = HashMap::new();
        registry.collect(root, &root_path(root), ROOT_SCOPE, false, false, &mut counters);
        registry
    }

    fn collect<'a>(
        &mut self,
        node: &'a Node,
        path: &str,
        scope: &'a str,
        in_phase: bool,
        in_step: bool,
        counters: &mut HashMap<&'a str, usize>,
    ) {
        let (scope, in_phase, in_step) = match &node.kind {
            NodeKind::Claude(_) | NodeKind::Text { .. } | NodeKind::Stop(_) => return,
            NodeKind::Phase(props) if !in_phase => (props.name.as_str(), true, false),
            NodeKind::Step(_) if !in_step => {
                let counter = counters.entry(scope).or_insert(0);
                self.slots.insert(
                    path.to_string(),
                    StepSlot {
                        scope: scope.to_string(),
                        ordinal: *counter,
                    },
                );
                *counter += 1;
                (scope, in_phase, true)
            }
            _ => (scope, in_phase, in_step),
        };
        for (child, child_path) in node.children.iter().zip(child_paths(path, &node.children)) {
            self.collect(child, &child_path, scope, in_phase, in_step, counters);
        }
    }

    fn ordinal(&self, path: &str) -> Option<usize> {
        self.slots.get(&structural_path(path)).map(|slot| slot.ordinal)
    }

    /// Lowest ordinal in `scope` among steps below `ancestor`.
    fn first_ordinal_below(&self, ancestor: &str, scope: &str) -> Option<usize> {
        let prefix = format!("{}/", structural_path(ancestor));
        self.slots
            .iter()
            .filter(|(path, slot)| slot.scope == scope && path.starts_with(&prefix))
            .map(|(_, slot)| slot.ordinal)
            .min()
    }
}

/// Drops Ralph iteration segments from a scan path.
fn structural_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.starts_with("iter["))
        .collect::<Vec<_>>()
        .join("/")
}

fn collect_ralph_ids(nodes: &[Node], out: &mut Vec<String>) {
    for node in nodes {
        if let NodeKind::Ralph(props) = &node.kind {
            out.push(props.id.clone());
        }
        collect_ralph_ids(&node.children, out);
    }
}

/// Paths of `children` under `parent`, indexed per type.
pub fn child_paths(parent: &str, children: &[Node]) -> Vec<String> {
    let mut counters: HashMap<&'static str, usize> = HashMap::new();
    children
        .iter()
        .map(|child| {
            let slot = counters.entry(child.type_name()).or_insert(0);
            let path = child_path(parent, child.type_name(), *slot);
            *slot += 1;
            path
        })
        .collect()
}

/// Path of the tree root.
pub fn root_path(root: &Node) -> String {
    child_path("", root.type_name(), 0)
}

/// Prompt sent to the executor: the `prompt` prop followed by descendant text.
pub fn resolve_prompt(node: &Node) -> String {
    let base = match &node.kind {
        NodeKind::Claude(props) => props.prompt.as_str(),
        _ => "",
    };
    let text = node.descendant_text();
    match (base.is_empty(), text.is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => text,
        (false, false) => format!("{base}\n{text}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Done,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone)]
struct Scope {
    /// Phase name owning step cursors, or `root`.
    step_scope: String,
    in_phase: bool,
    in_step: bool,
    iteration: u32,
    iter_prefix: Option<String>,
}

impl Scope {
    fn root() -> Self {
        Self {
            step_scope: ROOT_SCOPE.to_string(),
            in_phase: false,
            in_step: false,
            iteration: 0,
            iter_prefix: None,
        }
    }

    /// Persistence id: the path, or the explicit key scoped to the iteration.
    fn record_id(&self, node: &Node, path: &str) -> String {
        match (&node.key, &self.iter_prefix) {
            (Some(key), Some(prefix)) => format!("{prefix}/{key}"),
            (Some(key), None) => key.clone(),
            (None, _) => path.to_string(),
        }
    }
}

/// Runs the eligibility scan over `root`, advancing cursors in `store`.
pub fn scan(root: &Node, store: &StateStore) -> Result<ScanOutcome> {
    let mut scanner = Scanner {
        store,
        registry: PhaseRegistry::from_tree(root),
        steps: StepRegistry::from_tree(root),
        out: ScanOutcome {
            node_count: root.count(),
            ..ScanOutcome::default()
        },
    };

    let path = root_path(root);
    let progress = scanner.visit(root, &path, &Scope::root())?;
    scanner.out.tree_done = progress == Progress::Done;
    scanner.out.stop = scanner.find_stop(root, &path, &Scope::root())?;

    debug!(
        eligible = scanner.out.eligible.len(),
        gates = scanner.out.gates.len(),
        stop = scanner.out.stop.is_some(),
        done = scanner.out.tree_done,
        "Scan complete"
    );
    Ok(scanner.out)
}

struct Scanner<'a> {
    store: &'a StateStore,
    registry: PhaseRegistry,
    steps: StepRegistry,
    out: ScanOutcome,
}

impl Scanner<'_> {
    fn visit(&mut self, node: &Node, path: &str, scope: &Scope) -> Result<Progress> {
        match &node.kind {
            NodeKind::Text { .. } | NodeKind::Stop(_) => Ok(Progress::Done),
            NodeKind::Claude(_) => self.visit_executable(node, path, scope),
            NodeKind::Human(props) => self.visit_gate(node, props, path, scope),
            NodeKind::Phase(props) if !scope.in_phase => self.visit_phase(node, props, path, scope),
            NodeKind::Step(props) if !scope.in_step => self.visit_step(node, props, path, scope),
            NodeKind::Ralph(props) => self.visit_ralph(node, props, path, scope),
            NodeKind::Parallel | NodeKind::Subagent(SubagentProps { parallel: true, .. }) => {
                self.visit_children(&node.children, path, scope, Mode::Parallel)
            }
            _ => self.visit_children(&node.children, path, scope, Mode::Sequential),
        }
    }

    fn visit_children(
        &mut self,
        children: &[Node],
        parent: &str,
        scope: &Scope,
        mode: Mode,
    ) -> Result<Progress> {
        let mut progress = Progress::Done;
        for (child, path) in children.iter().zip(child_paths(parent, children)) {
            if self.visit(child, &path, scope)? == Progress::Pending {
                progress = Progress::Pending;
                if mode == Mode::Sequential {
                    break;
                }
            }
        }
        Ok(progress)
    }

    fn visit_executable(&mut self, node: &Node, path: &str, scope: &Scope) -> Result<Progress> {
        let id = scope.record_id(node, path);
        let hash = content_hash(node).unwrap_or_default();

        if let Some(record) = self.store.execution(&id) {
            match record.status {
                ExecutionStatus::Running => return Ok(Progress::Pending),
                ExecutionStatus::Complete if record.result_hash.as_deref() == Some(hash.as_str()) => {
                    return Ok(Progress::Done);
                }
                ExecutionStatus::Error | ExecutionStatus::Skipped => return Ok(Progress::Done),
                ExecutionStatus::Complete => {
                    debug!(path, "Content changed since completion, re-dispatching");
                }
                ExecutionStatus::Pending => {}
            }
        }

        self.out.eligible.push(EligibleNode {
            id,
            path: path.to_string(),
            node: node.clone(),
            content_hash: hash,
            iteration: scope.iteration,
        });
        Ok(Progress::Pending)
    }

    fn visit_gate(
        &mut self,
        node: &Node,
        props: &HumanProps,
        path: &str,
        scope: &Scope,
    ) -> Result<Progress> {
        let id = scope.record_id(node, path);
        match self.store.human_request(&id).map(|r| r.status) {
            Some(HumanStatus::Approved) => {
                self.visit_children(&node.children, path, scope, Mode::Sequential)
            }
            Some(HumanStatus::Rejected) => Ok(Progress::Done),
            Some(HumanStatus::Pending) | None => {
                self.out.gates.push(PendingGate {
                    id,
                    path: path.to_string(),
                    props: props.clone(),
                    handlers: node.handlers.clone(),
                    iteration: scope.iteration,
                });
                Ok(Progress::Pending)
            }
        }
    }

    fn phase_cursor(&self) -> Result<usize> {
        Ok(self.store.get_as::<usize>(PHASE_CURSOR_KEY)?.unwrap_or(0))
    }

    fn visit_phase(
        &mut self,
        node: &Node,
        props: &PhaseProps,
        path: &str,
        scope: &Scope,
    ) -> Result<Progress> {
        let Some(index) = self.registry.index_of(&props.name) else {
            return self.visit_children(&node.children, path, scope, Mode::Sequential);
        };
        let cursor = self.phase_cursor()?;
        if index < cursor {
            return Ok(Progress::Done);
        }
        if index > cursor {
            return Ok(Progress::Pending);
        }

        if props.skip_if {
            self.set_phase_status(&props.name, index, PhaseStatus::Skipped)?;
            self.advance_phase(index)?;
            return Ok(Progress::Done);
        }

        self.set_phase_status(&props.name, index, PhaseStatus::Running)?;
        let inner = Scope {
            step_scope: props.name.clone(),
            in_phase: true,
            in_step: false,
            ..scope.clone()
        };
        let progress = self.visit_children(&node.children, path, &inner, Mode::Sequential)?;
        if progress == Progress::Done {
            self.set_phase_status(&props.name, index, PhaseStatus::Completed)?;
            self.advance_phase(index)?;
        }
        Ok(progress)
    }

    fn set_phase_status(&mut self, name: &str, index: usize, status: PhaseStatus) -> Result<()> {
        if self.store.phase(name).map(|p| p.status) == Some(status) {
            return Ok(());
        }
        self.store.upsert_phase(name, index, status)?;
        info!(phase = %name, index, status = status.as_str(), "Phase transition");
        self.out.events.push(DebugEvent::PhaseAdvance {
            phase: name.to_string(),
            index,
            status: status.as_str().to_string(),
        });
        Ok(())
    }

    fn advance_phase(&mut self, index: usize) -> Result<()> {
        let next = index + 1;
        self.store.set(PHASE_CURSOR_KEY, next, WRITER)?;

        let already = self
            .store
            .get_as::<bool>(PHASES_COMPLETE_KEY)?
            .unwrap_or(false);
        if next >= self.registry.len() && !already {
            self.store.set(PHASES_COMPLETE_KEY, true, WRITER)?;
            self.out.all_phases_complete = true;
            let last = self.registry.names().last().cloned().unwrap_or_default();
            self.out.events.push(DebugEvent::PhaseAdvance {
                phase: last,
                index: next,
                status: "all_complete".to_string(),
            });
        }
        Ok(())
    }

    fn visit_step(
        &mut self,
        node: &Node,
        props: &StepProps,
        path: &str,
        scope: &Scope,
    ) -> Result<Progress> {
        let Some(ordinal) = self.steps.ordinal(path) else {
            return self.visit_children(&node.children, path, scope, Mode::Sequential);
        };
        let key = step_cursor_key(&scope.step_scope);
        let cursor = self.store.get_as::<usize>(&key)?.unwrap_or(0);

        if ordinal < cursor {
            return Ok(Progress::Done);
        }
        if ordinal > cursor {
            return Ok(Progress::Pending);
        }
        if props.skip_if {
            debug!(step = %props.name, "Step skipped");
            self.store.set(&key, ordinal + 1, WRITER)?;
            return Ok(Progress::Done);
        }

        let inner = Scope {
            in_step: true,
            ..scope.clone()
        };
        let progress = self.visit_children(&node.children, path, &inner, Mode::Sequential)?;
        if progress == Progress::Done {
            debug!(step = %props.name, scope = %scope.step_scope, "Step complete");
            self.store.set(&key, ordinal + 1, WRITER)?;
        }
        Ok(progress)
    }

    fn visit_ralph(
        &mut self,
        node: &Node,
        props: &RalphProps,
        path: &str,
        scope: &Scope,
    ) -> Result<Progress> {
        let key = ralph_iteration_key(&props.id);
        let mut iteration = self.store.get_as::<u32>(&key)?.unwrap_or(0);

        loop {
            let prefix = iteration_path(path, iteration);
            let inner = Scope {
                iteration,
                iter_prefix: Some(prefix.clone()),
                ..scope.clone()
            };
            if self.visit_children(&node.children, &prefix, &inner, Mode::Sequential)?
                == Progress::Pending
            {
                return Ok(Progress::Pending);
            }
            if props.done || iteration + 1 >= props.max_iterations {
                return Ok(Progress::Done);
            }

            iteration += 1;
            self.store.set(&key, iteration, WRITER)?;
            self.restart_body(node, path, scope)?;
            info!(ralph = %props.id, iteration, "Ralph iteration started");
        }
    }

    /// Rewinds cursors inside a Ralph body for its next iteration.
    fn restart_body(&mut self, node: &Node, path: &str, scope: &Scope) -> Result<()> {
        if !scope.in_phase {
            let mut body_phases = Vec::new();
            collect_phases(&node.children, &mut body_phases);
            let mut first: Option<usize> = None;
            for name in &body_phases {
                let Some(index) = self.registry.index_of(name) else {
                    continue;
                };
                first = Some(first.map_or(index, |f| f.min(index)));
                if self.store.phase(name).is_some() {
                    self.set_phase_status(name, index, PhaseStatus::Pending)?;
                }
                self.store.set(&step_cursor_key(name), 0, WRITER)?;
            }
            if let Some(first) = first {
                self.store.set(PHASE_CURSOR_KEY, first, WRITER)?;
                if self.store.get_as::<bool>(PHASES_COMPLETE_KEY)?.unwrap_or(false) {
                    self.store.set(PHASES_COMPLETE_KEY, false, WRITER)?;
                }
            }
        }

        if let Some(first) = self.steps.first_ordinal_below(path, &scope.step_scope) {
            self.store
                .set(&step_cursor_key(&scope.step_scope), first, WRITER)?;
        }

        let mut nested = Vec::new();
        collect_ralph_ids(&node.children, &mut nested);
        for id in nested {
            let key = ralph_iteration_key(&id);
            if self.store.get(&key).is_some() {
                self.store.set(&key, 0, WRITER)?;
            }
        }
        Ok(())
    }

    /// Finds the first Stop node not hidden behind an inactive phase or an
    /// unapproved gate.
    fn find_stop(&self, node: &Node, path: &str, scope: &Scope) -> Result<Option<StopSignal>> {
        match &node.kind {
            NodeKind::Stop(props) => {
                return Ok(Some(StopSignal {
                    path: path.to_string(),
                    reason: props.reason.clone(),
                }));
            }
            NodeKind::Claude(_) | NodeKind::Text { .. } => return Ok(None),
            NodeKind::Phase(props) if !scope.in_phase => {
                if self.registry.index_of(&props.name) != Some(self.phase_cursor()?) {
                    return Ok(None);
                }
                let inner = Scope {
                    in_phase: true,
                    ..scope.clone()
                };
                return self.find_stop_in(&node.children, path, &inner);
            }
            NodeKind::Human(_) => {
                let id = scope.record_id(node, path);
                let approved = self
                    .store
                    .human_request(&id)
                    .is_some_and(|r| r.status == HumanStatus::Approved);
                if !approved {
                    return Ok(None);
                }
            }
            NodeKind::Ralph(props) => {
                let iteration = self
                    .store
                    .get_as::<u32>(&ralph_iteration_key(&props.id))?
                    .unwrap_or(0);
                let prefix = iteration_path(path, iteration);
                let inner = Scope {
                    iteration,
                    iter_prefix: Some(prefix.clone()),
                    ..scope.clone()
                };
                return self.find_stop_in(&node.children, &prefix, &inner);
            }
            _ => {}
        }
        self.find_stop_in(&node.children, path, scope)
    }

    fn find_stop_in(&self, children: &[Node], parent: &str, scope: &Scope) -> Result<Option<StopSignal>> {
        for (child, path) in children.iter().zip(child_paths(parent, children)) {
            if let Some(stop) = self.find_stop(child, &path, scope)? {
                return Ok(Some(stop));
            }
        }
        Ok(None)
    }
}
