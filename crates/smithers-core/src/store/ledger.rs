//! Task ledger: one row per in-flight async unit of work.
//!
//! Termination detection reads the running count, so every started task must
//! be completed. `TaskGuard` completes its task when dropped, which covers
//! error returns, panics, and futures that are dropped mid-flight.

use super::StateStore;
use super::records::{TaskKind, TaskRecord, TaskStatus};
use chrono::Utc;
use serde_json::Value;
use smithers_proto::Result;
use tracing::{debug, warn};
use uuid::Uuid;

/// Task operations over a [`StateStore`].
#[derive(Debug, Clone)]
pub struct TaskLedger {
    store: StateStore,
}

impl TaskLedger {
    pub(crate) fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Records a new running task and returns its id.
    pub fn start(
        &self,
        kind: TaskKind,
        label: Option<&str>,
        meta: Option<Value>,
        iteration: u32,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.store.insert_task(TaskRecord {
            id: id.clone(),
            execution_id: self.store.execution_id(),
            kind,
            label: label.map(str::to_string),
            meta,
            status: TaskStatus::Running,
            iteration,
            started_at: Utc::now(),
            completed_at: None,
            orphaned: false,
        })?;
        debug!(task_id = %id, ?kind, label = label.unwrap_or(""), "Task started");
        Ok(id)
    }

    /// Starts a task whose completion is tied to the returned guard.
    pub fn guard(
        &self,
        kind: TaskKind,
        label: Option<&str>,
        iteration: u32,
    ) -> Result<TaskGuard> {
        let id = self.start(kind, label, None, iteration)?;
        Ok(TaskGuard {
            ledger: self.clone(),
            id,
            done: false,
        })
    }

    /// Completes a task. Completing twice, or an unknown id, is a no-op.
    pub fn complete(&self, id: &str) -> Result<()> {
        if self.store.finish_task(id)? {
            debug!(task_id = %id, "Task completed");
        }
        Ok(())
    }

    pub fn running_count(&self, execution_id: &str) -> usize {
        self.store.with_tasks(|tasks| {
            tasks
                .iter()
                .filter(|t| t.execution_id == execution_id && t.status == TaskStatus::Running)
                .count()
        })
    }

    pub fn total_count(&self, execution_id: &str) -> usize {
        self.store.with_tasks(|tasks| {
            tasks
                .iter()
                .filter(|t| t.execution_id == execution_id)
                .count()
        })
    }

    /// All task rows, in start order.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.store.with_tasks(<[TaskRecord]>::to_vec)
    }
}

/// Completes its task on drop.
#[derive(Debug)]
pub struct TaskGuard {
    ledger: TaskLedger,
    id: String,
    done: bool,
}

impl TaskGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Completes the task now, surfacing any journal error.
    pub fn complete(mut self) -> Result<()> {
        self.done = true;
        self.ledger.complete(&self.id)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.ledger.complete(&self.id) {
            warn!(task_id = %self.id, error = %e, "Failed to complete task on drop");
        }
    }
}
