//! # smithers-core
//!
//! Execution engine for the Smithers orchestration framework.
//!
//! This crate provides:
//! - Configuration loading and validation
//! - The state store, task ledger, and journal persistence
//! - Scheduler primitives: phases, steps, sequential/parallel groups, Ralph loops
//! - The frame-driven execution loop and its remote-control surface
//! - Debug event fan-out to tracing and JSONL sinks
//! - Tool-call retry with backoff

mod commands;
mod config;
mod context;
mod control;
mod debug_bus;
mod execution_loop;
mod hash;
mod retry;
mod scheduler;
mod store;
pub mod testing;

pub use commands::{CommandError, CommandParseError, ControlCommand, LoopHandle, help_text};
pub use config::{
    ApprovalConfig, ApprovalMode, ConfigError, ConfigWarning, DebugConfig, LoopConfig,
    SmithersConfig, StoreConfig,
};
pub use context::RunContext;
pub use control::{AutoApprove, AutoReject, format_tree};
pub use debug_bus::{DebugBus, DebugSink, JsonlSink, Record, TracingSink};
pub use execution_loop::{ExecutionLoop, RunResult, RunStatus, TerminationReason};
pub use hash::content_hash;
pub use retry::{RetryingToolRunner, retry_delay};
pub use scheduler::{
    EligibleNode, PHASE_CURSOR_KEY, PHASES_COMPLETE_KEY, PendingGate, PhaseRegistry, ScanOutcome,
    StopSignal, child_paths, ralph_iteration_key, resolve_prompt, root_path, scan,
    step_cursor_key,
};
pub use store::{
    AgentCall, ExecutionRecord, ExecutionStatus, HumanRequest, HumanStatus, JournalEntry,
    PhaseRecord, PhaseStatus, StateEntry, StateSnapshot, StateStore, TaskGuard, TaskKind,
    TaskLedger, TaskRecord, TaskStatus, Transition, read_journal,
};
