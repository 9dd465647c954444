//! # smithers-proto
//!
//! Shared types, error definitions, and traits for the Smithers orchestration engine.
//!
//! This crate provides the foundational abstractions used across all Smithers crates,
//! including:
//! - The snapshot `Node` tree and its path-addressing scheme
//! - Typed props for each node kind, plus reducer-style handlers
//! - The debug event union emitted by the execution loop
//! - The external collaborator traits (tree builder, executor, tool runner, approvals)
//! - Common error types

mod debug_event;
mod error;
mod interfaces;
mod mutation;
mod node;
mod tool;

pub use debug_event::{DebugEvent, DebugEventKind};
pub use error::{CorruptStateError, Error, NodeExecutionError, Result, ToolExecutionError};
pub use interfaces::{
    ApprovalHandler, ApprovalPrompt, ExecutionOutput, ExecutionRequest, Executor, HumanDecision,
    RenderContext, StateView, TreeBuilder,
};
pub use mutation::StateMutation;
pub use node::{
    AgentProps, Handlers, HumanProps, Node, NodeKind, PhaseProps, RalphProps, Reducer, StepProps,
    StopProps, SubagentProps, child_path, iteration_path,
};
pub use tool::{Backoff, RetryPolicy, ToolResult, ToolRunner};
