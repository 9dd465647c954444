//! CLI executor for running node prompts through external commands.
//!
//! Captures stdout and stderr concurrently. Supports an optional execution
//! timeout with graceful SIGTERM termination.

use crate::cli_backend::CliBackend;
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use smithers_proto::{Error, ExecutionOutput, ExecutionRequest, Executor, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of one command run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Whether the run was terminated due to timeout.
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Executor that hands each executable node's prompt to a [`CliBackend`].
#[derive(Debug, Clone)]
pub struct CliExecutor {
    backend: CliBackend,
    working_dir: Option<PathBuf>,
}

impl CliExecutor {
    pub fn new(backend: CliBackend) -> Self {
        Self {
            backend,
            working_dir: None,
        }
    }

    /// Runs commands in `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn backend(&self) -> &CliBackend {
        &self.backend
    }

    /// Runs the backend command for one prompt and captures its output.
    ///
    /// If `timeout` elapses first, the process receives SIGTERM and the
    /// result is marked `timed_out` with whatever exit status it reports.
    pub async fn run(
        &self,
        prompt: &str,
        model: Option<&str>,
        timeout: Option<Duration>,
    ) -> std::io::Result<CommandOutput> {
        let (cmd, args, stdin_input) = self.backend.build_command(prompt, model);

        let mut command = Command::new(&cmd);
        command.args(&args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(command = %cmd, args = ?args, cwd = ?self.working_dir, "Spawning CLI command");

        if stdin_input.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn()?;

        if let Some(input) = stdin_input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(input.as_bytes()).await?;
            drop(stdin); // EOF
        }

        // Both pipes are drained together so a chatty stderr cannot block stdout.
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();

        let stream_result = async {
            let stdout_future = async {
                let mut lines_out = Vec::new();
                if let Some(stdout) = stdout_handle {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Some(line) = lines.next_line().await? {
                        lines_out.push(line);
                    }
                }
                Ok::<_, std::io::Error>(lines_out)
            };

            let stderr_future = async {
                let mut lines_out = Vec::new();
                if let Some(stderr) = stderr_handle {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Some(line) = lines.next_line().await? {
                        lines_out.push(line);
                    }
                }
                Ok::<_, std::io::Error>(lines_out)
            };

            let (stdout_lines, stderr_lines) = tokio::try_join!(stdout_future, stderr_future)?;
            Ok::<_, std::io::Error>((join_lines(stdout_lines), join_lines(stderr_lines)))
        };

        let mut timed_out = false;
        let (stdout, stderr) = match timeout {
            Some(duration) => match tokio::time::timeout(duration, stream_result).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        timeout_ms = duration.as_millis() as u64,
                        command = %cmd,
                        "Execution timeout reached, sending SIGTERM"
                    );
                    timed_out = true;
                    Self::terminate_child(&child);
                    (String::new(), String::new())
                }
            },
            None => stream_result.await?,
        };

        let status = child.wait().await?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: status.code(),
            timed_out,
        })
    }

    fn terminate_child(child: &tokio::process::Child) {
        if let Some(pid) = child.id() {
            let pid = Pid::from_raw(pid as i32);
            debug!(%pid, "Sending SIGTERM to child process");
            let _ = kill(pid, Signal::SIGTERM);
        }
    }
}

fn join_lines(lines: Vec<String>) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[async_trait]
impl Executor for CliExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput> {
        let output = self
            .run(&request.prompt, request.model.as_deref(), request.timeout)
            .await?;

        if output.timed_out {
            let ms = request.timeout.map_or(0, |t| t.as_millis());
            return Err(Error::Executor(format!(
                "{} timed out after {ms}ms",
                self.backend.command
            )));
        }

        if !output.success() {
            let code = output
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            let stderr = output.stderr.trim();
            return Err(Error::Executor(if stderr.is_empty() {
                format!("{} exited with code {code}", self.backend.command)
            } else {
                format!("{} exited with code {code}: {stderr}", self.backend.command)
            }));
        }

        if !output.stderr.is_empty() {
            debug!(path = %request.path, stderr = %output.stderr.trim(), "CLI command wrote to stderr");
        }

        Ok(ExecutionOutput {
            output: output.stdout,
            tokens_used: None,
            raw: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli_backend::PromptMode;

    fn request(prompt: &str) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: "exec-1".to_string(),
            path: "claude[0]".to_string(),
            node_type: "claude".to_string(),
            prompt: prompt.to_string(),
            model: None,
            max_turns: None,
            timeout: None,
            iteration: 0,
            tools: None,
        }
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let executor = CliExecutor::new(CliBackend::custom("echo"));

        let output = executor.execute(request("hello world")).await.unwrap();

        assert_eq!(output.output, "hello world\n");
        assert_eq!(output.tokens_used, None);
    }

    #[tokio::test]
    async fn test_execute_stdin() {
        let executor =
            CliExecutor::new(CliBackend::custom("cat").with_prompt_mode(PromptMode::Stdin));

        let output = executor.execute(request("line one\nline two")).await.unwrap();

        assert_eq!(output.output, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error_with_code() {
        let backend = CliBackend::custom("sh").with_args(["-c", "echo boom >&2; exit 3", "sh"]);
        let executor = CliExecutor::new(backend);

        let err = executor.execute(request("ignored")).await.unwrap_err();

        match err {
            Error::Executor(message) => assert_eq!(message, "sh exited with code 3: boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_false_reports_exit_code() {
        let executor = CliExecutor::new(CliBackend::custom("false"));

        let output = executor.run("", None, None).await.unwrap();

        assert!(!output.success());
        assert_eq!(output.exit_code, Some(1));
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_sends_sigterm() {
        // The prompt lands as sleep's argument.
        let executor = CliExecutor::new(CliBackend::custom("sleep"));
        let mut req = request("10");
        req.timeout = Some(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = executor.execute(req).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            Error::Executor(message) => assert_eq!(message, "sleep timed out after 100ms"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let executor = CliExecutor::new(CliBackend::custom("cat")).with_working_dir(dir.path());

        let output = executor.execute(request("marker.txt")).await.unwrap();

        assert_eq!(output.output, "here\n");
    }

    #[tokio::test]
    async fn test_missing_command_is_io_error() {
        let executor = CliExecutor::new(CliBackend::custom("definitely-not-a-real-command-xyz"));

        let err = executor.execute(request("hi")).await.unwrap_err();

        assert!(matches!(err, Error::Io(_)));
    }
}
