//! Tool-call retry with fixed, linear, or exponential backoff.

use crate::store::{TaskKind, TaskLedger};
use async_trait::async_trait;
use serde_json::Value;
use smithers_proto::{Backoff, RetryPolicy, ToolExecutionError, ToolResult, ToolRunner};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before retry number `attempt` (1-based).
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay_ms;
    let ms = match policy.backoff {
        Backoff::Fixed => base,
        Backoff::Linear => base.saturating_mul(u64::from(attempt.max(1))),
        Backoff::Exponential => {
            let shift = attempt.saturating_sub(1).min(20);
            base.saturating_mul(1u64 << shift)
        }
    };
    Duration::from_millis(ms)
}

/// Wraps a [`ToolRunner`] with a retry policy.
///
/// When a ledger is attached, every call is tracked as a tool task so the
/// loop does not consider the run idle while a tool is in flight.
pub struct RetryingToolRunner {
    inner: Arc<dyn ToolRunner>,
    policy: RetryPolicy,
    ledger: Option<(TaskLedger, u32)>,
}

impl RetryingToolRunner {
    pub fn new(inner: Arc<dyn ToolRunner>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            ledger: None,
        }
    }

    /// Tracks each call as a tool task in `ledger`.
    pub fn with_ledger(mut self, ledger: TaskLedger, iteration: u32) -> Self {
        self.ledger = Some((ledger, iteration));
        self
    }

    async fn run_with_retries(
        &self,
        name: &str,
        input: &Value,
    ) -> Result<ToolResult, ToolExecutionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.run_tool(name, input).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt <= self.policy.max_retries => {
                    let delay = retry_delay(&self.policy, attempt);
                    debug!(tool = %name, attempt, delay_ms = delay.as_millis() as u64, error = %e.message, "Retrying tool call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let err = ToolExecutionError {
                        tool: name.to_string(),
                        message: e.message,
                        attempts: attempt,
                    };
                    if self.policy.continue_on_tool_failure {
                        warn!(tool = %name, attempts = attempt, error = %err.message, "Tool failed, continuing");
                        return Ok(ToolResult::error(err.to_string()));
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl ToolRunner for RetryingToolRunner {
    async fn run_tool(&self, name: &str, input: &Value) -> Result<ToolResult, ToolExecutionError> {
        let guard = match &self.ledger {
            Some((ledger, iteration)) => match ledger.guard(TaskKind::Tool, Some(name), *iteration) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!(tool = %name, error = %e, "Failed to record tool task");
                    None
                }
            },
            None => None,
        };
        let result = self.run_with_retries(name, input).await;
        drop(guard);
        result
    }
}
