//! Steering a running loop through its handle.

use serde_json::{Value, json};
use smithers_core::testing::{CollectingSink, MockExecutor};
use smithers_core::{
    ApprovalMode, CommandError, DebugBus, ExecutionLoop, ExecutionStatus, HumanStatus, LoopHandle,
    RunContext, RunStatus, SmithersConfig, StateStore, TaskKind, TerminationReason,
};
use smithers_proto::{
    Backoff, Error, Node, RenderContext, RetryPolicy, StateMutation, ToolExecutionError,
    ToolResult, ToolRunner,
};
use std::sync::Arc;
use std::time::Duration;

fn context(config: SmithersConfig) -> RunContext {
    RunContext::new(StateStore::in_memory("exec-control"), config)
}

fn three_nodes(_: &RenderContext<'_>) -> Node {
    Node::group().children([Node::claude("A"), Node::claude("B"), Node::claude("C")])
}

/// Retries `f` until the loop accepts the command.
async fn until_accepted<F, Fut>(f: F) -> String
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<String, CommandError>>,
{
    loop {
        match f().await {
            Ok(reply) => return reply,
            Err(CommandError::Rejected(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("command failed: {e}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_abort_stops_run_with_reason() {
    let executor = Arc::new(MockExecutor::new().delay("A", Duration::from_secs(30)));
    let exec_loop = ExecutionLoop::new(context(SmithersConfig::default()), three_nodes, executor.clone());
    let handle = exec_loop.handle();

    let (result, reply) = tokio::join!(exec_loop.run(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort("user requested").await
    });

    let result = result.unwrap();
    assert_eq!(reply.unwrap(), "Aborting: user requested");
    assert_eq!(result.status, RunStatus::Stopped);
    assert_eq!(result.reason, TerminationReason::Aborted);
    assert_eq!(result.message.as_deref(), Some("user requested"));
    assert_eq!(executor.call_count(), 1);
    assert!(matches!(
        result.ensure_completed(),
        Err(Error::LoopAborted { reason }) if reason == "user requested"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_running_loop() {
    let executor = Arc::new(MockExecutor::new().delay("A", Duration::from_secs(30)));
    let exec_loop = ExecutionLoop::new(context(SmithersConfig::default()), three_nodes, executor);
    let handle = exec_loop.handle();

    let (result, status) = tokio::join!(exec_loop.run(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = handle.status().await;
        handle.abort("done looking").await.unwrap();
        status
    });

    let status = status.unwrap();
    assert!(status.contains("execution: exec-control"));
    assert!(status.contains("state: running"));
    assert!(status.contains("tasks: 1 running / 1 total"));
    assert_eq!(result.unwrap().reason, TerminationReason::Aborted);
}

#[tokio::test(start_paused = true)]
async fn test_inject_prefixes_next_prompt_only() {
    let executor = Arc::new(MockExecutor::new());
    let exec_loop = ExecutionLoop::new(context(SmithersConfig::default()), three_nodes, executor.clone());
    let handle = exec_loop.handle();

    let (reply, result) = tokio::join!(handle.inject("Keep it short."), exec_loop.run());

    assert!(reply.unwrap().contains("Queued 1"));
    assert_eq!(result.unwrap().status, RunStatus::Completed);
    assert_eq!(executor.prompts(), vec!["Keep it short.\n\nA", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_pause_skip_resume() {
    let executor = Arc::new(MockExecutor::new());
    let ctx = context(SmithersConfig::default());
    let store = ctx.store.clone();
    let exec_loop = ExecutionLoop::new(ctx, three_nodes, executor.clone());
    let handle = exec_loop.handle();

    let (replies, result) = tokio::join!(
        async {
            let paused = handle.pause().await.unwrap();
            let status = handle.status().await.unwrap();
            let skipped = handle.skip(None).await.unwrap();
            let resumed = handle.resume().await.unwrap();
            (paused, status, skipped, resumed)
        },
        exec_loop.run()
    );

    let (paused, status, skipped, resumed) = replies;
    assert!(paused.starts_with("Paused"));
    assert!(status.contains("state: paused"));
    assert_eq!(skipped, "Skipped group[0]/claude[0]");
    assert_eq!(resumed, "Resumed.");
    assert_eq!(result.unwrap().status, RunStatus::Completed);
    assert_eq!(executor.prompts(), vec!["B", "C"]);
    assert_eq!(
        store.execution("group[0]/claude[0]").unwrap().status,
        ExecutionStatus::Skipped
    );
}

#[tokio::test(start_paused = true)]
async fn test_skip_unknown_path_is_rejected() {
    let executor = Arc::new(MockExecutor::new());
    let exec_loop = ExecutionLoop::new(context(SmithersConfig::default()), three_nodes, executor);
    let handle: LoopHandle = exec_loop.handle();

    let (reply, _) = tokio::join!(handle.skip(Some("group[0]/claude[9]")), exec_loop.run());
    assert_eq!(
        reply,
        Err(CommandError::Rejected(
            "No eligible or running node at group[0]/claude[9]".to_string()
        ))
    );
}

#[tokio::test(start_paused = true)]
async fn test_manual_approval_waits_for_command() {
    let mut config = SmithersConfig::default();
    config.approvals.mode = ApprovalMode::Manual;
    let ctx = context(config);
    let store = ctx.store.clone();
    let executor = Arc::new(MockExecutor::new());
    let sink = CollectingSink::new();
    let mut bus = DebugBus::enabled();
    bus.add_sink(sink.clone());

    let builder = |_: &RenderContext<'_>| {
        Node::group().child(
            Node::human("Merge the PR?")
                .with_key("merge-gate")
                .on_approve(|_| vec![StateMutation::set("merged", true)])
                .child(Node::claude("merge")),
        )
    };
    let exec_loop = ExecutionLoop::new(ctx, builder, executor.clone()).with_debug_bus(bus);
    let handle = exec_loop.handle();

    let (result, reply) = tokio::join!(exec_loop.run(), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        until_accepted(|| handle.approve("merge-gate")).await
    });

    assert_eq!(reply, "Approved merge-gate");
    assert_eq!(result.unwrap().status, RunStatus::Completed);
    assert_eq!(executor.prompts(), vec!["merge"]);
    assert_eq!(sink.count("control:human"), 1);
    assert_eq!(store.get("merged"), Some(json!(true)));
    assert_eq!(
        store.human_request("merge-gate").unwrap().status,
        HumanStatus::Approved
    );
}

#[tokio::test(start_paused = true)]
async fn test_manual_rejection() {
    let mut config = SmithersConfig::default();
    config.approvals.mode = ApprovalMode::Manual;
    let ctx = context(config);
    let store = ctx.store.clone();
    let executor = Arc::new(MockExecutor::new());
    let builder = |_: &RenderContext<'_>| {
        Node::group().child(Node::human("Release?").child(Node::claude("release")))
    };
    let exec_loop = ExecutionLoop::new(ctx, builder, executor.clone());
    let handle = exec_loop.handle();

    let (result, reply) = tokio::join!(exec_loop.run(), until_accepted(|| handle.reject("group[0]/human[0]")));

    assert_eq!(reply, "Rejected group[0]/human[0]");
    assert_eq!(result.unwrap().status, RunStatus::Completed);
    assert_eq!(executor.call_count(), 0);
    assert_eq!(
        store.human_request("group[0]/human[0]").unwrap().status,
        HumanStatus::Rejected
    );
}

#[tokio::test(start_paused = true)]
async fn test_tree_command_renders_status() {
    let executor = Arc::new(MockExecutor::new().delay("A", Duration::from_secs(1)));
    let exec_loop = ExecutionLoop::new(context(SmithersConfig::default()), three_nodes, executor);
    let handle = exec_loop.handle();

    let (_, tree) = tokio::join!(exec_loop.run(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.execute_line("/tree").await
    });

    assert_eq!(
        tree.unwrap(),
        "group\n  claude group[0]/claude[0] [running]\n  claude group[0]/claude[1] [pending]\n  claude group[0]/claude[2] [pending]\n"
    );
}

/// Always fails.
struct BrokenTool;

#[async_trait::async_trait]
impl ToolRunner for BrokenTool {
    async fn run_tool(&self, name: &str, _input: &Value) -> Result<ToolResult, ToolExecutionError> {
        Err(ToolExecutionError::new(name, "connection refused"))
    }
}

fn retry_policy(continue_on_tool_failure: bool) -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay_ms: 100,
        backoff: Backoff::Exponential,
        continue_on_tool_failure,
    }
}

#[tokio::test(start_paused = true)]
async fn test_tool_failure_can_be_tolerated() {
    let executor = Arc::new(MockExecutor::new().call_tool("A", "shell", json!("make test")));
    let ctx = context(SmithersConfig::default());
    let store = ctx.store.clone();
    let builder = |_: &RenderContext<'_>| Node::claude("A").with_retry(retry_policy(true));

    let result = ExecutionLoop::new(ctx, builder, executor.clone())
        .with_tools(Arc::new(BrokenTool))
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    let tool_result = executor.calls()[0].tool_result.clone().unwrap();
    assert!(tool_result.is_error);
    let tool_tasks = store
        .ledger()
        .tasks()
        .into_iter()
        .filter(|t| t.kind == TaskKind::Tool)
        .count();
    assert_eq!(tool_tasks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_tool_failure_fails_node_by_default() {
    let executor = Arc::new(MockExecutor::new().call_tool("A", "shell", json!("make test")));
    let builder = |_: &RenderContext<'_>| Node::claude("A").with_retry(retry_policy(false));

    let err = ExecutionLoop::new(context(SmithersConfig::default()), builder, executor)
        .with_tools(Arc::new(BrokenTool))
        .run()
        .await
        .unwrap_err();

    match err {
        Error::NodeExecution(e) => {
            assert_eq!(e.node_path, "claude[0]");
            assert_eq!(
                e.message,
                "tool 'shell' failed after 3 attempt(s): connection refused"
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
