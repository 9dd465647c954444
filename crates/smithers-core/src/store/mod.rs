//! Persistent state store.
//!
//! `StateStore` holds the key/value state (with its transition history), the
//! task ledger, execution records, phase records, the agent-call log, and
//! human requests for one execution id. A persistent store journals every
//! write to `<dir>/<execution_id>.jsonl` and replays it on open.
//!
//! The store is a cheap cloneable handle. Its lock is never held across an
//! await point.

mod journal;
mod ledger;
mod records;

pub use journal::{JournalEntry, read_journal};
pub use ledger::{TaskGuard, TaskLedger};
pub use records::{
    AgentCall, ExecutionRecord, ExecutionStatus, HumanRequest, HumanStatus, PhaseRecord,
    PhaseStatus, StateEntry, TaskKind, TaskRecord, TaskStatus, Transition,
};

use chrono::{DateTime, Utc};
use journal::Journal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use smithers_proto::{CorruptStateError, Result, StateMutation, StateView};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Tables {
    kv: HashMap<String, StateEntry>,
    history: Vec<Transition>,
    tasks: Vec<TaskRecord>,
    task_index: HashMap<String, usize>,
    executions: BTreeMap<String, ExecutionRecord>,
    phases: BTreeMap<String, PhaseRecord>,
    agents: Vec<AgentCall>,
    human: BTreeMap<String, HumanRequest>,
}

impl Tables {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::State(t) => {
                self.kv.insert(
                    t.key.clone(),
                    StateEntry {
                        key: t.key.clone(),
                        value: t.value.clone(),
                        updated_at: t.timestamp,
                        written_by: t.written_by.clone(),
                    },
                );
                self.history.push(t);
            }
            JournalEntry::TaskStart(task) => {
                self.task_index.insert(task.id.clone(), self.tasks.len());
                self.tasks.push(task);
            }
            JournalEntry::TaskComplete {
                id,
                completed_at,
                orphaned,
            } => {
                if let Some(&idx) = self.task_index.get(&id) {
                    let task = &mut self.tasks[idx];
                    task.status = TaskStatus::Complete;
                    task.completed_at = Some(completed_at);
                    task.orphaned = orphaned;
                }
            }
            JournalEntry::Execution(record) => {
                self.executions.insert(record.id.clone(), record);
            }
            JournalEntry::Phase(record) => {
                self.phases.insert(record.name.clone(), record);
            }
            JournalEntry::Agent(call) => self.agents.push(call),
            JournalEntry::Human(request) => {
                self.human.insert(request.id.clone(), request);
            }
            JournalEntry::Reset { .. } => *self = Tables::default(),
        }
    }
}

struct Inner {
    execution_id: String,
    dir: Option<PathBuf>,
    journal: Option<Journal>,
    tables: Tables,
}

impl Inner {
    /// Journals an entry, then applies it in memory.
    fn write(&mut self, entry: JournalEntry) -> Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&entry)?;
        }
        self.tables.apply(entry);
        Ok(())
    }

    fn transition(&self, key: &str, value: Value, writer: &str) -> JournalEntry {
        JournalEntry::State(Transition {
            key: key.to_string(),
            value,
            execution_id: self.execution_id.clone(),
            written_by: writer.to_string(),
            timestamp: Utc::now(),
        })
    }
}

/// Handle to the state of one execution.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("StateStore")
            .field("execution_id", &inner.execution_id)
            .field("dir", &inner.dir)
            .field("keys", &inner.tables.kv.len())
            .finish()
    }
}

impl StateStore {
    /// Creates a store that lives only in memory.
    pub fn in_memory(execution_id: impl Into<String>) -> Self {
        Self::from_inner(Inner {
            execution_id: execution_id.into(),
            dir: None,
            journal: None,
            tables: Tables::default(),
        })
    }

    /// Opens (or creates) the journal for `execution_id` under `dir`.
    ///
    /// An existing journal is replayed. Tasks it left running are completed
    /// as orphans and their execution records go back to pending, so a
    /// resumed run re-dispatches them instead of waiting forever.
    pub fn open(dir: impl AsRef<Path>, execution_id: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let execution_id = execution_id.into();
        let path = dir.join(format!("{execution_id}.jsonl"));

        let mut tables = Tables::default();
        let replayed = if path.exists() {
            let entries = read_journal(&path)?;
            let count = entries.len();
            for entry in entries {
                tables.apply(entry);
            }
            count
        } else {
            0
        };

        let journal = Journal::open(&path)?;
        let mut inner = Inner {
            execution_id,
            dir: Some(dir),
            journal: Some(journal),
            tables,
        };

        if replayed > 0 {
            recover_orphans(&mut inner)?;
            info!(
                execution_id = %inner.execution_id,
                entries = replayed,
                "Resumed state from journal"
            );
        }

        Ok(Self::from_inner(inner))
    }

    /// Loads the journal for `execution_id` under `dir` without opening it
    /// for writing.
    ///
    /// No orphan recovery runs, so tasks a live run has in flight still show
    /// as running. Writes to the returned store stay in memory.
    pub fn replay(dir: impl AsRef<Path>, execution_id: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let execution_id = execution_id.into();
        let path = dir.join(format!("{execution_id}.jsonl"));

        let mut tables = Tables::default();
        let entries = read_journal(&path)?;
        debug!(execution_id = %execution_id, entries = entries.len(), "Replaying journal read-only");
        for entry in entries {
            tables.apply(entry);
        }

        Ok(Self::from_inner(Inner {
            execution_id,
            dir: Some(dir),
            journal: None,
            tables,
        }))
    }

    fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn execution_id(&self) -> String {
        self.lock().execution_id.clone()
    }

    /// Path of the backing journal, if persistent.
    pub fn journal_path(&self) -> Option<PathBuf> {
        self.lock().journal.as_ref().map(|j| j.path().to_path_buf())
    }

    /// Returns a ledger view over this store's tasks.
    pub fn ledger(&self) -> TaskLedger {
        TaskLedger::new(self.clone())
    }

    // ── Key/value state ───────────────────────────────────────────────────

    /// Returns the latest value of `key`, or `None` if it was never written.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().tables.kv.get(key).map(|e| e.value.clone())
    }

    /// Returns the latest value of `key` decoded as `T`.
    ///
    /// A value that exists but does not decode is a `CorruptStateError`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| {
                    CorruptStateError {
                        line: 0,
                        detail: format!("key '{key}': {e}"),
                    }
                    .into()
                }),
        }
    }

    pub fn entry(&self, key: &str) -> Option<StateEntry> {
        self.lock().tables.kv.get(key).cloned()
    }

    /// Upserts `key` and appends a transition.
    pub fn set(&self, key: &str, value: impl Serialize, writer: &str) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut inner = self.lock();
        let entry = inner.transition(key, value, writer);
        inner.write(entry)
    }

    /// Applies several writes in order under one lock acquisition.
    pub fn set_many(&self, mutations: &[StateMutation], writer: &str) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock();
        for m in mutations {
            let entry = inner.transition(&m.key, m.value.clone(), writer);
            inner.write(entry)?;
        }
        debug!(writer, count = mutations.len(), "Applied state mutations");
        Ok(())
    }

    /// Transition history of `key`, oldest first.
    ///
    /// With a limit, only the most recent `limit` transitions are returned
    /// (still oldest first).
    pub fn history(&self, key: &str, limit: Option<usize>) -> Vec<Transition> {
        let inner = self.lock();
        let all: Vec<Transition> = inner
            .tables
            .history
            .iter()
            .filter(|t| t.key == key)
            .cloned()
            .collect();
        match limit {
            Some(n) if n < all.len() => all[all.len() - n..].to_vec(),
            _ => all,
        }
    }

    /// Value of `key` as it was at `at`, replayed from history.
    pub fn value_as_of(&self, key: &str, at: DateTime<Utc>) -> Option<Value> {
        let inner = self.lock();
        inner
            .tables
            .history
            .iter()
            .filter(|t| t.key == key && t.timestamp <= at)
            .last()
            .map(|t| t.value.clone())
    }

    /// Copies every current key/value pair, for a frozen render view.
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        StateSnapshot {
            values: inner
                .tables
                .kv
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect(),
        }
    }

    // ── Execution records ─────────────────────────────────────────────────

    pub fn execution(&self, id: &str) -> Option<ExecutionRecord> {
        self.lock().tables.executions.get(id).cloned()
    }

    pub fn upsert_execution(&self, record: ExecutionRecord) -> Result<()> {
        self.lock().write(JournalEntry::Execution(record))
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.lock().tables.executions.values().cloned().collect()
    }

    // ── Phases ────────────────────────────────────────────────────────────

    pub fn phase(&self, name: &str) -> Option<PhaseRecord> {
        self.lock().tables.phases.get(name).cloned()
    }

    pub fn upsert_phase(&self, name: &str, index: usize, status: PhaseStatus) -> Result<()> {
        self.lock().write(JournalEntry::Phase(PhaseRecord {
            name: name.to_string(),
            index,
            status,
            updated_at: Utc::now(),
        }))
    }

    /// Phase records ordered by index.
    pub fn phases(&self) -> Vec<PhaseRecord> {
        let mut phases: Vec<PhaseRecord> = self.lock().tables.phases.values().cloned().collect();
        phases.sort_by_key(|p| p.index);
        phases
    }

    // ── Agent-call log ────────────────────────────────────────────────────

    pub fn record_agent_call(&self, call: AgentCall) -> Result<()> {
        self.lock().write(JournalEntry::Agent(call))
    }

    pub fn agent_calls(&self) -> Vec<AgentCall> {
        self.lock().tables.agents.clone()
    }

    /// Sum of `tokens_used` across every logged executor call.
    pub fn total_tokens(&self) -> u64 {
        self.lock()
            .tables
            .agents
            .iter()
            .filter_map(|c| c.tokens_used)
            .sum()
    }

    // ── Human interactions ────────────────────────────────────────────────

    pub fn human_request(&self, id: &str) -> Option<HumanRequest> {
        self.lock().tables.human.get(id).cloned()
    }

    pub fn upsert_human(&self, request: HumanRequest) -> Result<()> {
        self.lock().write(JournalEntry::Human(request))
    }

    pub fn human_requests(&self) -> Vec<HumanRequest> {
        self.lock().tables.human.values().cloned().collect()
    }

    /// Resolves a pending request. Returns the updated request, or `None` if
    /// it does not exist or was already resolved.
    pub fn resolve_human(&self, id: &str, approved: bool) -> Result<Option<HumanRequest>> {
        let mut inner = self.lock();
        let Some(mut request) = inner.tables.human.get(id).cloned() else {
            return Ok(None);
        };
        if request.status != HumanStatus::Pending {
            return Ok(None);
        }
        request.status = if approved {
            HumanStatus::Approved
        } else {
            HumanStatus::Rejected
        };
        request.resolved_at = Some(Utc::now());
        inner.write(JournalEntry::Human(request.clone()))?;
        Ok(Some(request))
    }

    // ── Reset ─────────────────────────────────────────────────────────────

    /// Clears every table and switches to a fresh execution id.
    ///
    /// A persistent store starts a new journal for the new id.
    pub fn reset(&self, new_execution_id: impl Into<String>) -> Result<()> {
        let new_execution_id = new_execution_id.into();
        let mut inner = self.lock();
        if let Some(dir) = inner.dir.clone() {
            let path = dir.join(format!("{new_execution_id}.jsonl"));
            inner.journal = Some(Journal::create(&path)?);
        }
        info!(
            from = %inner.execution_id,
            to = %new_execution_id,
            "Resetting execution state"
        );
        inner.execution_id = new_execution_id.clone();
        inner.write(JournalEntry::Reset {
            execution_id: new_execution_id,
            at: Utc::now(),
        })
    }

    // ── Ledger internals ──────────────────────────────────────────────────

    pub(crate) fn insert_task(&self, task: TaskRecord) -> Result<()> {
        self.lock().write(JournalEntry::TaskStart(task))
    }

    /// Marks a task complete. Returns false if it was already complete or unknown.
    pub(crate) fn finish_task(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock();
        let running = inner
            .tables
            .task_index
            .get(id)
            .map(|&idx| inner.tables.tasks[idx].status == TaskStatus::Running)
            .unwrap_or(false);
        if !running {
            return Ok(false);
        }
        inner.write(JournalEntry::TaskComplete {
            id: id.to_string(),
            completed_at: Utc::now(),
            orphaned: false,
        })?;
        Ok(true)
    }

    pub(crate) fn with_tasks<R>(&self, f: impl FnOnce(&[TaskRecord]) -> R) -> R {
        f(&self.lock().tables.tasks)
    }
}

impl StateView for StateStore {
    fn get(&self, key: &str) -> Option<Value> {
        StateStore::get(self, key)
    }
}

fn recover_orphans(inner: &mut Inner) -> Result<()> {
    let orphans: Vec<String> = inner
        .tables
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .map(|t| t.id.clone())
        .collect();
    for id in &orphans {
        inner.write(JournalEntry::TaskComplete {
            id: id.clone(),
            completed_at: Utc::now(),
            orphaned: true,
        })?;
    }

    let stale: Vec<ExecutionRecord> = inner
        .tables
        .executions
        .values()
        .filter(|r| r.status == ExecutionStatus::Running)
        .cloned()
        .collect();
    for mut record in stale {
        record.status = ExecutionStatus::Pending;
        record.started_at = None;
        inner.write(JournalEntry::Execution(record))?;
    }

    if !orphans.is_empty() {
        warn!(count = orphans.len(), "Completed orphaned tasks from a previous process");
    }
    Ok(())
}

/// Frozen copy of key/value state handed to the tree builder.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    values: HashMap<String, Value>,
}

impl StateSnapshot {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl StateView for StateSnapshot {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smithers_proto::Error;

    #[test]
    fn test_get_missing_key_is_none() {
        let store = StateStore::in_memory("exec-1");
        assert_eq!(store.get("nope"), None);
        assert!(store.get_as::<u32>("nope").unwrap().is_none());
        assert!(store.history("nope", None).is_empty());
    }

    #[test]
    fn test_set_appends_history() {
        let store = StateStore::in_memory("exec-1");
        store.set("count", 1, "a").unwrap();
        store.set("count", 2, "b").unwrap();
        store.set("other", "x", "a").unwrap();

        assert_eq!(store.get("count"), Some(json!(2)));
        assert_eq!(store.entry("count").unwrap().written_by, "b");

        let history = store.history("count", None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, json!(1));
        assert_eq!(history[1].value, json!(2));
        assert_eq!(history[1].execution_id, "exec-1");

        let last = store.history("count", Some(1));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].value, json!(2));
    }

    #[test]
    fn test_set_many_applies_in_order() {
        let store = StateStore::in_memory("exec-1");
        store
            .set_many(
                &[
                    StateMutation::set("k", 1),
                    StateMutation::set("k", 2),
                    StateMutation::set("done", true),
                ],
                "group[0]/claude[0]",
            )
            .unwrap();
        assert_eq!(store.get("k"), Some(json!(2)));
        assert_eq!(store.history("k", None).len(), 2);
        assert_eq!(store.get_as::<bool>("done").unwrap(), Some(true));
    }

    #[test]
    fn test_value_as_of() {
        let store = StateStore::in_memory("exec-1");
        store.set("k", "old", "t").unwrap();
        let between = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.set("k", "new", "t").unwrap();

        assert_eq!(store.value_as_of("k", between), Some(json!("old")));
        assert_eq!(store.value_as_of("k", Utc::now()), Some(json!("new")));
    }

    #[test]
    fn test_get_as_wrong_shape_is_corrupt() {
        let store = StateStore::in_memory("exec-1");
        store.set("currentPhaseIndex", "two", "t").unwrap();
        let err = store.get_as::<usize>("currentPhaseIndex").unwrap_err();
        assert!(matches!(err, Error::CorruptState(_)));
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let store = StateStore::in_memory("exec-1");
        store.set("k", 1, "t").unwrap();
        let snapshot = store.snapshot();
        store.set("k", 2, "t").unwrap();
        assert_eq!(StateView::get(&snapshot, "k"), Some(json!(1)));
    }

    #[test]
    fn test_resolve_human_once() {
        let store = StateStore::in_memory("exec-1");
        store
            .upsert_human(HumanRequest {
                id: "gate".to_string(),
                path: "human[0]".to_string(),
                kind: "approval".to_string(),
                message: "Ship?".to_string(),
                status: HumanStatus::Pending,
                created_at: Utc::now(),
                resolved_at: None,
            })
            .unwrap();

        let resolved = store.resolve_human("gate", false).unwrap().unwrap();
        assert_eq!(resolved.status, HumanStatus::Rejected);
        assert!(store.resolve_human("gate", true).unwrap().is_none());
        assert_eq!(store.human_request("gate").unwrap().status, HumanStatus::Rejected);
        assert!(store.resolve_human("missing", true).unwrap().is_none());
    }

    #[test]
    fn test_persistent_store_replays() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StateStore::open(dir.path(), "exec-1").unwrap();
            store.set("k", "v", "t").unwrap();
            store.upsert_phase("plan", 0, PhaseStatus::Completed).unwrap();
            let mut record = ExecutionRecord::new("claude[0]", "claude[0]", "claude");
            record.status = ExecutionStatus::Complete;
            record.result_hash = Some("abc".to_string());
            store.upsert_execution(record).unwrap();
        }

        let store = StateStore::open(dir.path(), "exec-1").unwrap();
        assert_eq!(store.get("k"), Some(json!("v")));
        assert_eq!(store.phase("plan").unwrap().status, PhaseStatus::Completed);
        let record = store.execution("claude[0]").unwrap();
        assert_eq!(record.status, ExecutionStatus::Complete);
        assert_eq!(record.result_hash.as_deref(), Some("abc"));
        assert_eq!(
            store.journal_path().unwrap(),
            dir.path().join("exec-1.jsonl")
        );
    }

    #[test]
    fn test_open_recovers_orphans() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StateStore::open(dir.path(), "exec-1").unwrap();
            let ledger = store.ledger();
            let id = ledger.start(TaskKind::Node, Some("claude[0]"), None, 0).unwrap();
            let mut record = ExecutionRecord::new("claude[0]", "claude[0]", "claude");
            record.status = ExecutionStatus::Running;
            store.upsert_execution(record).unwrap();
            assert_eq!(ledger.running_count("exec-1"), 1);
            // The process "crashes" here with the task still running.
            let _ = id;
        }

        let store = StateStore::open(dir.path(), "exec-1").unwrap();
        let ledger = store.ledger();
        assert_eq!(ledger.running_count("exec-1"), 0);
        assert_eq!(ledger.total_count("exec-1"), 1);
        assert!(ledger.tasks().iter().all(|t| t.orphaned));
        assert_eq!(
            store.execution("claude[0]").unwrap().status,
            ExecutionStatus::Pending
        );
    }

    #[test]
    fn test_replay_leaves_live_journal_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let live = StateStore::open(dir.path(), "exec-1").unwrap();
        live.ledger()
            .start(TaskKind::Node, Some("claude[0]"), None, 0)
            .unwrap();
        let mut record = ExecutionRecord::new("claude[0]", "claude[0]", "claude");
        record.status = ExecutionStatus::Running;
        live.upsert_execution(record).unwrap();

        let journal = dir.path().join("exec-1.jsonl");
        let before = std::fs::read_to_string(&journal).unwrap();

        let view = StateStore::replay(dir.path(), "exec-1").unwrap();
        assert_eq!(view.ledger().running_count("exec-1"), 1);
        assert_eq!(
            view.execution("claude[0]").unwrap().status,
            ExecutionStatus::Running
        );
        assert_eq!(view.journal_path(), None);
        assert_eq!(std::fs::read_to_string(&journal).unwrap(), before);
    }

    #[test]
    fn test_replay_missing_journal_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StateStore::replay(dir.path(), "nope").is_err());
    }

    #[test]
    fn test_corrupt_journal_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("exec-1.jsonl"), "{\"table\":\"bogus\"}\n").unwrap();
        let err = StateStore::open(dir.path(), "exec-1").unwrap_err();
        match err {
            Error::CorruptState(e) => assert_eq!(e.line, 1),
            other => panic!("expected corrupt state, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_clears_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), "exec-1").unwrap();
        store.set("k", 1, "t").unwrap();
        store.ledger().start(TaskKind::Node, None, None, 0).unwrap();

        store.reset("exec-2").unwrap();
        assert_eq!(store.execution_id(), "exec-2");
        assert_eq!(store.get("k"), None);
        assert_eq!(store.ledger().total_count("exec-2"), 0);
        assert!(dir.path().join("exec-2.jsonl").exists());

        // The old journal still replays on its own.
        let old = StateStore::open(dir.path(), "exec-1").unwrap();
        assert_eq!(old.get("k"), Some(json!(1)));
    }
}
