//! Resuming a persisted execution.

use smithers_core::testing::MockExecutor;
use smithers_core::{
    ExecutionLoop, ExecutionRecord, ExecutionStatus, PHASE_CURSOR_KEY, RunContext, RunStatus,
    SmithersConfig, StateStore, TaskKind, read_journal,
};
use smithers_proto::{Node, RenderContext, StateMutation};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn persistent_config(dir: &Path) -> SmithersConfig {
    let mut config = SmithersConfig::default();
    config.store.dir = dir.display().to_string();
    config
}

fn tree(second_prompt: &'static str) -> impl Fn(&RenderContext<'_>) -> Node + Send + Sync {
    move |_: &RenderContext<'_>| {
        Node::group().children([
            Node::phase("plan").child(
                Node::claude("Plan the change")
                    .on_finished(|out| vec![StateMutation::set("plan", &out.output)]),
            ),
            Node::phase("implement").child(Node::claude(second_prompt)),
        ])
    }
}

async fn run(dir: &Path, second_prompt: &'static str) -> (Arc<MockExecutor>, RunStatus) {
    let ctx = RunContext::open(persistent_config(dir), Some("exec-resume".to_string())).unwrap();
    let executor = Arc::new(MockExecutor::new());
    let result = ExecutionLoop::new(ctx, tree(second_prompt), executor.clone())
        .run()
        .await
        .unwrap();
    (executor, result.status)
}

#[tokio::test(start_paused = true)]
async fn test_completed_nodes_are_not_redispatched() {
    let dir = TempDir::new().unwrap();

    let (first, status) = run(dir.path(), "Implement it").await;
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(first.call_count(), 2);

    let (second, status) = run(dir.path(), "Implement it").await;
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(second.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_changed_content_reruns_only_that_node() {
    let dir = TempDir::new().unwrap();
    run(dir.path(), "Implement it").await;

    let ctx = RunContext::open(persistent_config(dir.path()), Some("exec-resume".to_string())).unwrap();
    // Rewind to the second phase; the first phase's record still matches.
    ctx.store.set(PHASE_CURSOR_KEY, 1, "test").unwrap();
    let executor = Arc::new(MockExecutor::new());
    ExecutionLoop::new(ctx, tree("Implement it, with tests"), executor.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(executor.prompts(), vec!["Implement it, with tests"]);
}

#[tokio::test(start_paused = true)]
async fn test_state_and_history_survive_reopen() {
    let dir = TempDir::new().unwrap();
    run(dir.path(), "Implement it").await;

    let store = StateStore::open(dir.path(), "exec-resume").unwrap();
    assert_eq!(store.get_as::<String>("plan").unwrap().as_deref(), Some("ok: Plan the change"));
    let history = store.history(PHASE_CURSOR_KEY, None);
    let cursors: Vec<u64> = history.iter().filter_map(|t| t.value.as_u64()).collect();
    assert_eq!(cursors, vec![1, 2]);
    assert_eq!(store.agent_calls().len(), 2);

    let entries = read_journal(&dir.path().join("exec-resume.jsonl")).unwrap();
    assert!(!entries.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_orphaned_tasks_are_recovered_and_redispatched() {
    let dir = TempDir::new().unwrap();
    {
        // A process that died mid-dispatch.
        let store = StateStore::open(dir.path(), "exec-crash").unwrap();
        store
            .ledger()
            .start(TaskKind::Node, Some("claude[0]"), None, 0)
            .unwrap();
        let mut record = ExecutionRecord::new("claude[0]", "claude[0]", "claude");
        record.status = ExecutionStatus::Running;
        store.upsert_execution(record).unwrap();
    }

    let ctx = RunContext::open(persistent_config(dir.path()), Some("exec-crash".to_string())).unwrap();
    let ledger = ctx.store.ledger();
    assert_eq!(ledger.running_count("exec-crash"), 0);
    assert!(ledger.tasks()[0].orphaned);
    assert_eq!(
        ctx.store.execution("claude[0]").unwrap().status,
        ExecutionStatus::Pending
    );

    let executor = Arc::new(MockExecutor::new());
    let result = ExecutionLoop::new(ctx, |_: &RenderContext<'_>| Node::claude("Retry me"), executor.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(executor.call_count(), 1);
}
