//! Row types held by the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution status of a node at one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Complete,
    Error,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Complete => "complete",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    /// Returns true once the node no longer blocks its siblings.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Complete | ExecutionStatus::Error | ExecutionStatus::Skipped
        )
    }
}

/// Persisted execution state of one executable node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Persistence key: the node's path, or its explicit key.
    pub id: String,
    pub path: String,
    pub node_type: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub result_hash: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub iteration: u32,
}

impl ExecutionRecord {
    pub fn new(id: impl Into<String>, path: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            node_type: node_type.into(),
            status: ExecutionStatus::Pending,
            result_hash: None,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            iteration: 0,
        }
    }
}

/// Latest value of a state key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
    pub written_by: String,
}

/// One append-only write to a state key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub key: String,
    pub value: Value,
    pub execution_id: String,
    pub written_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// An executable node dispatched to the executor.
    Node,
    /// A human gate awaiting resolution.
    Human,
    /// A tool call made during a node's execution.
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Complete,
}

/// One in-flight (or finished) async unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub execution_id: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
    pub status: TaskStatus,
    #[serde(default)]
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the task was left running by a process that exited.
    #[serde(default)]
    pub orphaned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub index: usize,
    pub status: PhaseStatus,
    pub updated_at: DateTime<Utc>,
}

/// Log row for one executor call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCall {
    pub path: String,
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanStatus {
    Pending,
    Approved,
    Rejected,
}

impl HumanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HumanStatus::Pending => "pending",
            HumanStatus::Approved => "approved",
            HumanStatus::Rejected => "rejected",
        }
    }
}

/// A human gate's request, resolved exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanRequest {
    pub id: String,
    pub path: String,
    pub kind: String,
    pub message: String,
    pub status: HumanStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}
