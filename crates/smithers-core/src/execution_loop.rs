//! The frame-driven execution loop.
//!
//! Each frame renders a fresh tree, scans it for eligible work, checks for a
//! reachable Stop node, and dispatches executable nodes and human gates.
//! Dispatches run as spawned tasks and report back over a channel; the loop
//! applies their results (records, ledger, reducers) on its own task before
//! the next render, so reducers never race a scan.
//!
//! Termination is detected from the task ledger: once nothing is running and
//! a render produces no new work, the loop waits one settle window (longer if
//! no task has ever started) and re-renders before declaring completion.

use crate::commands::{CommandError, CommandRequest, ControlCommand, LoopHandle, help_text};
use crate::config::{ApprovalMode, LoopConfig};
use crate::context::RunContext;
use crate::control::{AutoApprove, format_tree};
use crate::debug_bus::DebugBus;
use crate::retry::RetryingToolRunner;
use crate::scheduler::{EligibleNode, PendingGate, resolve_prompt, scan};
use crate::store::{
    AgentCall, ExecutionRecord, ExecutionStatus, HumanRequest, HumanStatus, TaskGuard, TaskKind,
    TaskLedger,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use smithers_proto::{
    ApprovalHandler, ApprovalPrompt, DebugEvent, DebugEventKind, Error, ExecutionOutput,
    ExecutionRequest, Executor, Handlers, HumanDecision, Node, NodeExecutionError, NodeKind,
    RenderContext, Result, StateMutation, ToolRunner, TreeBuilder,
};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Nothing left to run and nothing running.
    NoPendingNodes,
    /// A reachable Stop node was rendered.
    StopNode,
    /// Aborted through the loop handle.
    Aborted,
    /// The frame budget ran out with work remaining.
    MaxFrames,
    GlobalTimeout,
    /// Total tokens reported by executors reached the budget.
    TokenBudget,
    /// A node failed without an error handler.
    NodeError,
}

impl TerminationReason {
    /// Returns the exit code for this termination reason.
    ///
    /// - 0: completed
    /// - 1: a node failed
    /// - 2: frame budget exhausted
    /// - 130: stopped or aborted
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationReason::NoPendingNodes => 0,
            TerminationReason::NodeError => 1,
            TerminationReason::MaxFrames => 2,
            TerminationReason::StopNode
            | TerminationReason::Aborted
            | TerminationReason::GlobalTimeout
            | TerminationReason::TokenBudget => 130,
        }
    }

    /// Returns the reason string used in `loop:terminated` events.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::NoPendingNodes => "no_pending_nodes",
            TerminationReason::StopNode => "stop_node",
            TerminationReason::Aborted => "aborted",
            TerminationReason::MaxFrames => "max_frames",
            TerminationReason::GlobalTimeout => "global_timeout",
            TerminationReason::TokenBudget => "token_budget",
            TerminationReason::NodeError => "node_error",
        }
    }
}

/// Terminal status of a run that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Stopped,
    MaxFramesReached,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::MaxFramesReached => "max-frames-reached",
        }
    }
}

/// Outcome of a run that terminated without a node failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub status: RunStatus,
    pub reason: TerminationReason,
    /// Stop reason or abort reason, when one was given.
    pub message: Option<String>,
    pub frames: u32,
    /// Output of the last node that completed.
    pub output: Option<String>,
    pub duration_ms: u64,
    pub execution_id: String,
}

impl RunResult {
    /// Converts non-completed outcomes into their error form.
    pub fn ensure_completed(self) -> Result<Self> {
        match self.status {
            RunStatus::Completed => Ok(self),
            RunStatus::MaxFramesReached => Err(Error::MaxFramesExceeded {
                frames: self.frames,
            }),
            RunStatus::Stopped => Err(Error::LoopAborted {
                reason: self
                    .message
                    .unwrap_or_else(|| self.reason.as_str().to_string()),
            }),
        }
    }
}

enum LoopMessage {
    NodeSettled {
        id: String,
        guard: TaskGuard,
        result: Result<ExecutionOutput>,
    },
    HumanResolved {
        request_id: String,
        approved: bool,
    },
}

struct InFlight {
    path: String,
    node_type: &'static str,
    content_hash: String,
    prompt: String,
    model: Option<String>,
    handlers: Handlers,
    started: Instant,
    started_at: DateTime<Utc>,
}

struct AwaitingGate {
    path: String,
    message: String,
    guard: TaskGuard,
    handlers: Handlers,
}

/// Single-owner settle timer.
///
/// The deadline survives interruptions (a command arriving mid-window) and
/// is only cleared explicitly when new work shows up.
struct SettleTimer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl SettleTimer {
    fn new() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    fn arm(&mut self, window: Duration) {
        if !self.armed {
            self.sleep.as_mut().reset(Instant::now() + window);
            self.armed = true;
        }
    }

    fn cancel(&mut self) {
        self.armed = false;
    }

    async fn wait(&mut self) {
        if !self.armed {
            return std::future::pending().await;
        }
        (&mut self.sleep).await;
        self.armed = false;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drives a tree to completion.
pub struct ExecutionLoop {
    ctx: RunContext,
    builder: Arc<dyn TreeBuilder>,
    executor: Arc<dyn Executor>,
    tools: Option<Arc<dyn ToolRunner>>,
    approver: Option<Arc<dyn ApprovalHandler>>,
    bus: DebugBus,
    ledger: TaskLedger,

    frames: u32,
    paused: bool,
    abort_reason: Option<String>,
    injected: Vec<String>,
    last_output: Option<String>,
    last_tree: Option<Node>,
    last_eligible: Vec<EligibleNode>,
    in_flight: HashMap<String, InFlight>,
    awaiting: HashMap<String, AwaitingGate>,

    messages_tx: mpsc::UnboundedSender<LoopMessage>,
    messages_rx: mpsc::UnboundedReceiver<LoopMessage>,
    commands_tx: mpsc::UnboundedSender<CommandRequest>,
    commands_rx: mpsc::UnboundedReceiver<CommandRequest>,
}

impl ExecutionLoop {
    /// Creates a loop over `ctx`.
    ///
    /// Human gates are auto-approved unless approvals are configured as
    /// manual, in which case they wait for `/approve` or `/reject`. The debug
    /// bus is built from `ctx.config.debug`.
    pub fn new(
        ctx: RunContext,
        builder: impl TreeBuilder + 'static,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let approver: Option<Arc<dyn ApprovalHandler>> = match ctx.config.approvals.mode {
            ApprovalMode::Auto => Some(Arc::new(AutoApprove)),
            ApprovalMode::Manual => None,
        };
        let bus = DebugBus::from_config(&ctx.config.debug).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to open debug event file, debug events disabled");
            DebugBus::disabled()
        });
        let ledger = ctx.store.ledger();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Self {
            ctx,
            builder: Arc::new(builder),
            executor,
            tools: None,
            approver,
            bus,
            ledger,
            frames: 0,
            paused: false,
            abort_reason: None,
            injected: Vec::new(),
            last_output: None,
            last_tree: None,
            last_eligible: Vec::new(),
            in_flight: HashMap::new(),
            awaiting: HashMap::new(),
            messages_tx,
            messages_rx,
            commands_tx,
            commands_rx,
        }
    }

    /// Provides a tool runner to executors, wrapped in each node's retry policy.
    pub fn with_tools(mut self, tools: Arc<dyn ToolRunner>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Resolves human gates through `approver` instead of the configured mode.
    pub fn with_approver(mut self, approver: Arc<dyn ApprovalHandler>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_debug_bus(mut self, bus: DebugBus) -> Self {
        self.bus = bus;
        self
    }

    /// Returns a handle for steering the loop while it runs.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(self.commands_tx.clone())
    }

    fn loop_config(&self) -> &LoopConfig {
        &self.ctx.config.loop_config
    }

    /// Runs until the tree is done, a stop condition holds, or a node fails.
    ///
    /// A node failure without an `on_error` handler is returned as
    /// `Err(Error::NodeExecution)`. Every other termination is an `Ok`.
    pub async fn run(mut self) -> Result<RunResult> {
        let started = Instant::now();
        let deadline = self.loop_config().global_timeout().map(|t| started + t);
        let min_interval = self.loop_config().min_frame_interval();
        let mut settle = SettleTimer::new();
        let mut settled = false;
        let mut last_frame_start: Option<Instant> = None;

        info!(execution_id = %self.ctx.execution_id, "Starting execution loop");

        loop {
            while let Ok(request) = self.commands_rx.try_recv() {
                self.handle_command(request);
            }

            if let Some(reason) = self.abort_reason.take() {
                return Ok(self.finish(started, RunStatus::Stopped, TerminationReason::Aborted, Some(reason)));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(self.finish(started, RunStatus::Stopped, TerminationReason::GlobalTimeout, None));
            }
            if let Some(budget) = self.loop_config().max_total_tokens {
                let used = self.ctx.store.total_tokens();
                if used >= budget {
                    info!(used, budget, "Token budget exhausted");
                    return Ok(self.finish(started, RunStatus::Stopped, TerminationReason::TokenBudget, None));
                }
            }

            if let Some(last) = last_frame_start {
                let next = last + min_interval;
                if Instant::now() < next {
                    tokio::time::sleep_until(next).await;
                }
            }

            let tree = self.render();
            let outcome = scan(&tree, &self.ctx.store)?;
            self.last_tree = Some(tree);
            if outcome.all_phases_complete {
                info!(execution_id = %self.ctx.execution_id, "All phases complete");
            }
            let tree_done = outcome.tree_done;
            for event in outcome.events {
                self.bus.emit(event);
            }

            if let Some(stop) = outcome.stop {
                info!(path = %stop.path, reason = stop.reason.as_deref().unwrap_or(""), "Stop node reached");
                self.bus.emit(DebugEvent::ControlStop {
                    reason: stop.reason.clone(),
                });
                return Ok(self.finish(started, RunStatus::Stopped, TerminationReason::StopNode, stop.reason));
            }

            let new_gates: Vec<PendingGate> = outcome
                .gates
                .into_iter()
                .filter(|g| !self.awaiting.contains_key(&g.id))
                .collect();
            self.last_eligible = outcome.eligible;
            let has_work = !self.last_eligible.is_empty() || !new_gates.is_empty();

            if has_work && !self.paused {
                if let Some(max) = self.loop_config().max_frames {
                    if self.frames >= max {
                        warn!(frames = self.frames, max, "Frame budget exhausted with work remaining");
                        return Ok(self.finish(started, RunStatus::MaxFramesReached, TerminationReason::MaxFrames, None));
                    }
                }
                self.frames += 1;
                last_frame_start = Some(Instant::now());
                settle.cancel();
                settled = false;

                let frame = self.frames;
                self.bus.emit(DebugEvent::FrameStart { frame });
                self.bus.emit_with(DebugEventKind::FrameRender, || DebugEvent::FrameRender {
                    frame,
                    node_count: outcome.node_count,
                });
                if self.bus.is_enabled_for(DebugEventKind::NodeFound) {
                    for node in &self.last_eligible {
                        self.bus.emit(DebugEvent::NodeFound {
                            path: node.path.clone(),
                            node_type: node.node.type_name().to_string(),
                            content_hash: node.content_hash.clone(),
                        });
                    }
                }

                let eligible = std::mem::take(&mut self.last_eligible);
                let mut dispatched = 0;
                for node in &eligible {
                    self.dispatch(node)?;
                    dispatched += 1;
                }
                for gate in new_gates {
                    self.register_gate(gate)?;
                    dispatched += 1;
                }
                debug!(frame, dispatched, running = self.in_flight.len(), "Frame dispatched");
                self.bus.emit(DebugEvent::FrameEnd {
                    frame,
                    dispatched,
                    running: self.in_flight.len(),
                });
            }

            if !self.in_flight.is_empty() || !self.awaiting.is_empty() {
                self.wait_for_activity(deadline).await?;
                settle.cancel();
                settled = false;
                continue;
            }

            if self.paused {
                tokio::select! {
                    Some(request) = self.commands_rx.recv() => self.handle_command(request),
                    () = sleep_until_opt(deadline) => {}
                }
                continue;
            }

            if settled {
                if !tree_done {
                    warn!("Settled with unfinished nodes that never became eligible");
                }
                return Ok(self.finish(started, RunStatus::Completed, TerminationReason::NoPendingNodes, None));
            }

            let window = if self.ledger.total_count(&self.ctx.execution_id) == 0 {
                self.loop_config().initial_settle()
            } else {
                self.loop_config().trailing_settle()
            };
            settle.arm(window);
            tokio::select! {
                () = settle.wait() => settled = true,
                Some(request) = self.commands_rx.recv() => self.handle_command(request),
                () = sleep_until_opt(deadline) => {}
            }
        }
    }

    fn render(&self) -> Node {
        let snapshot = self.ctx.store.snapshot();
        let ctx = RenderContext::new(&self.ctx.execution_id, self.frames + 1, &snapshot);
        self.builder.build(&ctx)
    }

    fn finish(
        &mut self,
        started: Instant,
        status: RunStatus,
        reason: TerminationReason,
        message: Option<String>,
    ) -> RunResult {
        if !self.in_flight.is_empty() {
            debug!(in_flight = self.in_flight.len(), "Leaving in-flight dispatches to finish on their own");
        }
        self.bus.emit(DebugEvent::LoopTerminated {
            reason: reason.as_str().to_string(),
        });
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            reason = reason.as_str(),
            status = status.as_str(),
            frames = self.frames,
            duration_ms,
            "Execution loop terminated"
        );
        RunResult {
            status,
            reason,
            message,
            frames: self.frames,
            output: self.last_output.take(),
            duration_ms,
            execution_id: self.ctx.execution_id.clone(),
        }
    }

    fn dispatch(&mut self, node: &EligibleNode) -> Result<()> {
        let NodeKind::Claude(props) = &node.node.kind else {
            return Ok(());
        };
        let node_type = node.node.type_name();
        let guard = self
            .ledger
            .guard(TaskKind::Node, Some(&node.path), node.iteration)?;

        let started_at = Utc::now();
        let mut record = self
            .ctx
            .store
            .execution(&node.id)
            .unwrap_or_else(|| ExecutionRecord::new(&node.id, &node.path, node_type));
        record.status = ExecutionStatus::Running;
        record.result_hash = Some(node.content_hash.clone());
        record.error = None;
        record.started_at = Some(started_at);
        record.finished_at = None;
        record.iteration = node.iteration;
        self.ctx.store.upsert_execution(record)?;

        self.bus.emit_with(DebugEventKind::NodeExecuteStart, || DebugEvent::NodeExecuteStart {
            path: node.path.clone(),
            node_type: node_type.to_string(),
        });

        let mut prompt = resolve_prompt(&node.node);
        if !self.injected.is_empty() {
            let injected = self.injected.drain(..).collect::<Vec<_>>().join("\n");
            prompt = format!("{injected}\n\n{prompt}");
        }

        let tools = self.tools.as_ref().map(|inner| {
            let policy = props
                .retry
                .clone()
                .unwrap_or_else(|| self.ctx.config.retry.clone());
            Arc::new(
                RetryingToolRunner::new(inner.clone(), policy)
                    .with_ledger(self.ledger.clone(), node.iteration),
            ) as Arc<dyn ToolRunner>
        });

        let request = ExecutionRequest {
            execution_id: self.ctx.execution_id.clone(),
            path: node.path.clone(),
            node_type: node_type.to_string(),
            prompt: prompt.clone(),
            model: props.model.clone(),
            max_turns: props.max_turns,
            timeout: props.timeout_ms.map(Duration::from_millis),
            iteration: node.iteration,
            tools,
        };

        info!(path = %node.path, iteration = node.iteration, "Dispatching node");
        self.in_flight.insert(
            node.id.clone(),
            InFlight {
                path: node.path.clone(),
                node_type,
                content_hash: node.content_hash.clone(),
                prompt,
                model: props.model.clone(),
                handlers: node.node.handlers.clone(),
                started: Instant::now(),
                started_at,
            },
        );

        let executor = self.executor.clone();
        let tx = self.messages_tx.clone();
        let id = node.id.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(executor.execute(request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Executor("executor panicked".to_string())));
            // If the loop is gone the guard drops here and still completes the task.
            let _ = tx.send(LoopMessage::NodeSettled { id, guard, result });
        });
        Ok(())
    }

    fn register_gate(&mut self, gate: PendingGate) -> Result<()> {
        if self.ctx.store.human_request(&gate.id).is_none() {
            self.ctx.store.upsert_human(HumanRequest {
                id: gate.id.clone(),
                path: gate.path.clone(),
                kind: gate.props.kind.clone(),
                message: gate.props.message.clone(),
                status: HumanStatus::Pending,
                created_at: Utc::now(),
                resolved_at: None,
            })?;
        }
        let guard = self
            .ledger
            .guard(TaskKind::Human, Some(&gate.path), gate.iteration)?;

        info!(request_id = %gate.id, message = %gate.props.message, "Human gate awaiting resolution");
        self.bus.emit_with(DebugEventKind::ControlHuman, || DebugEvent::ControlHuman {
            request_id: gate.id.clone(),
            message: gate.props.message.clone(),
        });

        match &self.approver {
            Some(approver) => {
                let approver = approver.clone();
                let tx = self.messages_tx.clone();
                let prompt = ApprovalPrompt {
                    request_id: gate.id.clone(),
                    path: gate.path.clone(),
                    kind: gate.props.kind.clone(),
                    message: gate.props.message.clone(),
                };
                tokio::spawn(async move {
                    let approved = approver.decide(&prompt).await;
                    let _ = tx.send(LoopMessage::HumanResolved {
                        request_id: prompt.request_id,
                        approved,
                    });
                });
            }
            None => info!(request_id = %gate.id, "Waiting for /approve or /reject"),
        }

        self.awaiting.insert(
            gate.id,
            AwaitingGate {
                path: gate.path,
                message: gate.props.message,
                guard,
                handlers: gate.handlers,
            },
        );
        Ok(())
    }

    async fn wait_for_activity(&mut self, deadline: Option<Instant>) -> Result<()> {
        tokio::select! {
            Some(message) = self.messages_rx.recv() => self.handle_message(message)?,
            Some(request) = self.commands_rx.recv() => self.handle_command(request),
            () = sleep_until_opt(deadline) => {}
        }
        while let Ok(message) = self.messages_rx.try_recv() {
            self.handle_message(message)?;
        }
        Ok(())
    }

    fn handle_message(&mut self, message: LoopMessage) -> Result<()> {
        match message {
            LoopMessage::NodeSettled { id, guard, result } => self.settle_node(&id, guard, result),
            LoopMessage::HumanResolved {
                request_id,
                approved,
            } => self.resolve_gate(&request_id, approved).map(|_| ()),
        }
    }

    fn settle_node(
        &mut self,
        id: &str,
        guard: TaskGuard,
        result: Result<ExecutionOutput>,
    ) -> Result<()> {
        let Some(flight) = self.in_flight.remove(id) else {
            return guard.complete();
        };
        let store = &self.ctx.store;
        let finished_at = Utc::now();
        let duration_ms = flight.started.elapsed().as_millis() as u64;

        let mut record = store
            .execution(id)
            .unwrap_or_else(|| ExecutionRecord::new(id, &flight.path, flight.node_type));
        let skipped = record.status == ExecutionStatus::Skipped;
        record.finished_at = Some(finished_at);

        let mut call = AgentCall {
            path: flight.path.clone(),
            model: flight.model.clone(),
            prompt: flight.prompt.clone(),
            output: None,
            error: None,
            tokens_used: None,
            status: ExecutionStatus::Complete,
            started_at: flight.started_at,
            finished_at,
        };

        match result {
            Ok(output) => {
                if !skipped {
                    record.status = ExecutionStatus::Complete;
                    record.result_hash = Some(flight.content_hash.clone());
                }
                record.result = Some(output.output.clone());
                store.upsert_execution(record)?;
                call.output = Some(output.output.clone());
                call.tokens_used = output.tokens_used;
                store.record_agent_call(call)?;
                guard.complete()?;

                info!(path = %flight.path, duration_ms, "Node complete");
                self.emit_end(&flight.path, duration_ms, "complete");

                if !skipped {
                    if let Some(on_finished) = &flight.handlers.on_finished {
                        self.apply(&on_finished(&output), &flight.path)?;
                    }
                }
                self.last_output = Some(output.output);
                Ok(())
            }
            Err(e) => {
                let err = NodeExecutionError {
                    message: error_message(e),
                    node_type: flight.node_type.to_string(),
                    node_path: flight.path.clone(),
                    input: flight.prompt.clone(),
                };
                if !skipped {
                    record.status = ExecutionStatus::Error;
                }
                record.error = Some(err.message.clone());
                store.upsert_execution(record)?;
                call.status = ExecutionStatus::Error;
                call.error = Some(err.message.clone());
                store.record_agent_call(call)?;
                guard.complete()?;

                warn!(path = %flight.path, error = %err.message, "Node failed");
                self.emit_end(&flight.path, duration_ms, "error");

                if skipped {
                    return Ok(());
                }
                match &flight.handlers.on_error {
                    Some(on_error) => self.apply(&on_error(&err), &flight.path),
                    None => {
                        error!(path = %flight.path, "Node failed without an error handler, aborting run");
                        self.bus.emit(DebugEvent::LoopTerminated {
                            reason: TerminationReason::NodeError.as_str().to_string(),
                        });
                        Err(Error::NodeExecution(err))
                    }
                }
            }
        }
    }

    fn emit_end(&self, path: &str, duration_ms: u64, status: &str) {
        self.bus.emit_with(DebugEventKind::NodeExecuteEnd, || DebugEvent::NodeExecuteEnd {
            path: path.to_string(),
            duration_ms,
            status: status.to_string(),
        });
    }

    fn apply(&self, mutations: &[StateMutation], writer: &str) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        debug!(writer, count = mutations.len(), "Applying state mutations");
        self.ctx.store.set_many(mutations, writer)
    }

    /// Resolves an awaited gate. Returns false if it is not awaited.
    fn resolve_gate(&mut self, request_id: &str, approved: bool) -> Result<bool> {
        let Some(gate) = self.awaiting.remove(request_id) else {
            return Ok(false);
        };
        self.ctx.store.resolve_human(request_id, approved)?;
        gate.guard.complete()?;
        info!(request_id, approved, "Human request resolved");

        let decision = HumanDecision {
            request_id: request_id.to_string(),
            message: gate.message,
            approved,
        };
        let handler = if approved {
            &gate.handlers.on_approve
        } else {
            &gate.handlers.on_reject
        };
        if let Some(handler) = handler {
            self.apply(&handler(&decision), &gate.path)?;
        }
        Ok(true)
    }

    fn handle_command(&mut self, request: CommandRequest) {
        debug!(command = %request.command, "Control command received");
        let reply = self.apply_command(request.command);
        if let Err(e) = &reply {
            warn!(error = %e, "Control command failed");
        }
        let _ = request.reply.send(reply);
    }

    fn apply_command(&mut self, command: ControlCommand) -> std::result::Result<String, CommandError> {
        match command {
            ControlCommand::Pause => {
                self.paused = true;
                info!("Dispatch paused");
                Ok("Paused. Running nodes will finish; no new nodes will start.".to_string())
            }
            ControlCommand::Resume => {
                self.paused = false;
                info!("Dispatch resumed");
                Ok("Resumed.".to_string())
            }
            ControlCommand::Skip(target) => self.skip(target.as_deref()),
            ControlCommand::Inject(text) => {
                self.injected.push(text);
                Ok(format!("Queued {} message(s) for the next dispatch.", self.injected.len()))
            }
            ControlCommand::Abort(reason) => {
                info!(reason = %reason, "Abort requested");
                self.abort_reason = Some(reason.clone());
                Ok(format!("Aborting: {reason}"))
            }
            ControlCommand::Status => Ok(self.status_text()),
            ControlCommand::Tree { full } => Ok(self
                .last_tree
                .as_ref()
                .map_or_else(|| "No tree rendered yet.".to_string(), |tree| format_tree(tree, &self.ctx.store, full))),
            ControlCommand::Help(topic) => Ok(help_text(topic.as_deref())),
            ControlCommand::Approve(id) => self.resolve_by_command(&id, true),
            ControlCommand::Reject(id) => self.resolve_by_command(&id, false),
        }
    }

    fn resolve_by_command(&mut self, id: &str, approved: bool) -> std::result::Result<String, CommandError> {
        match self.resolve_gate(id, approved) {
            Ok(true) => Ok(format!(
                "{} {id}",
                if approved { "Approved" } else { "Rejected" }
            )),
            Ok(false) => Err(CommandError::Rejected(format!("No pending human request: {id}"))),
            Err(e) => Err(CommandError::Rejected(e.to_string())),
        }
    }

    fn skip(&mut self, target: Option<&str>) -> std::result::Result<String, CommandError> {
        let found = match target {
            Some(target) => self
                .last_eligible
                .iter()
                .find(|n| n.path == target || n.id == target)
                .map(|n| (n.id.clone(), n.path.clone(), n.node.type_name(), n.content_hash.clone()))
                .or_else(|| {
                    self.in_flight
                        .iter()
                        .find(|(id, f)| f.path == target || id.as_str() == target)
                        .map(|(id, f)| (id.clone(), f.path.clone(), f.node_type, f.content_hash.clone()))
                }),
            None => self
                .last_eligible
                .first()
                .map(|n| (n.id.clone(), n.path.clone(), n.node.type_name(), n.content_hash.clone())),
        };
        let Some((id, path, node_type, hash)) = found else {
            return Err(CommandError::Rejected(match target {
                Some(target) => format!("No eligible or running node at {target}"),
                None => "No eligible node to skip".to_string(),
            }));
        };

        let mut record = self
            .ctx
            .store
            .execution(&id)
            .unwrap_or_else(|| ExecutionRecord::new(&id, &path, node_type));
        record.status = ExecutionStatus::Skipped;
        record.result_hash = Some(hash);
        self.ctx
            .store
            .upsert_execution(record)
            .map_err(|e| CommandError::Rejected(e.to_string()))?;
        self.last_eligible.retain(|n| n.id != id);
        info!(path = %path, "Node skipped");
        Ok(format!("Skipped {path}"))
    }

    fn status_text(&self) -> String {
        let execution_id = &self.ctx.execution_id;
        let mut lines = vec![
            format!("execution: {execution_id}"),
            format!(
                "state: {}",
                if self.paused { "paused" } else { "running" }
            ),
            format!("frames: {}", self.frames),
            format!(
                "tasks: {} running / {} total",
                self.ledger.running_count(execution_id),
                self.ledger.total_count(execution_id)
            ),
            format!("tokens: {}", self.ctx.store.total_tokens()),
        ];
        let mut running: Vec<_> = self.in_flight.values().map(|f| f.path.as_str()).collect();
        running.sort_unstable();
        for path in running {
            lines.push(format!("running: {path}"));
        }
        let mut awaiting: Vec<_> = self.awaiting.keys().map(String::as_str).collect();
        awaiting.sort_unstable();
        for id in awaiting {
            lines.push(format!("awaiting approval: {id}"));
        }
        lines.join("\n")
    }
}

fn error_message(error: Error) -> String {
    match error {
        Error::Executor(message) => message,
        Error::NodeExecution(e) => e.message,
        other => other.to_string(),
    }
}
