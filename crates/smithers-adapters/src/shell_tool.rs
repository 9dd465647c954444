//! The `shell` tool.

use async_trait::async_trait;
use serde_json::{Value, json};
use smithers_proto::{ToolExecutionError, ToolResult, ToolRunner};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Name under which [`ShellToolRunner`] serves commands.
pub const SHELL_TOOL: &str = "shell";

/// Runs `sh -c <command>` for the `shell` tool.
///
/// Input is either a bare string or `{"command": "..."}`. Success yields
/// `{"stdout": ..., "exit_code": 0}`; a non-zero exit is a failed attempt,
/// left to the caller's retry policy.
#[derive(Debug, Clone, Default)]
pub struct ShellToolRunner {
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ShellToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Kills commands that outlive `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command_from(input: &Value) -> Option<&str> {
        match input {
            Value::String(cmd) => Some(cmd),
            Value::Object(map) => map.get("command").and_then(Value::as_str),
            _ => None,
        }
    }
}

#[async_trait]
impl ToolRunner for ShellToolRunner {
    async fn run_tool(&self, name: &str, input: &Value) -> Result<ToolResult, ToolExecutionError> {
        if name != SHELL_TOOL {
            return Err(ToolExecutionError::new(name, "unknown tool"));
        }
        let Some(script) = Self::command_from(input) else {
            return Err(ToolExecutionError::new(
                name,
                "input must be a string or {\"command\": string}",
            ));
        };

        debug!(command = %script, "Running shell tool");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let run = command.output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(ToolExecutionError::new(
                        name,
                        format!("timed out after {}ms", limit.as_millis()),
                    ));
                }
            },
            None => run.await,
        }
        .map_err(|e| ToolExecutionError::new(name, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        match output.status.code() {
            Some(0) => Ok(ToolResult::ok(json!({ "stdout": stdout, "exit_code": 0 }))),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                Err(ToolExecutionError::new(
                    name,
                    format!("exit code {code}: {}", stderr.trim()),
                ))
            }
        }
    }
}
