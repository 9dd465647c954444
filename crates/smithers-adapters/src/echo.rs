//! Executor that performs no work.

use async_trait::async_trait;
use smithers_proto::{ExecutionOutput, ExecutionRequest, Executor, Result};
use tracing::info;

/// Answers every request with its own prompt. Used by `--dry-run`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput> {
        info!(path = %request.path, model = ?request.model, "Dry run");
        Ok(ExecutionOutput::text(request.prompt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echoes_prompt() {
        let output = EchoExecutor
            .execute(ExecutionRequest {
                execution_id: "exec-1".to_string(),
                path: "phase[0]/claude[0]".to_string(),
                node_type: "claude".to_string(),
                prompt: "Plan the change".to_string(),
                model: Some("sonnet".to_string()),
                max_turns: None,
                timeout: None,
                iteration: 0,
                tools: None,
            })
            .await
            .unwrap();
        assert_eq!(output, ExecutionOutput::text("Plan the change"));
    }
}
