//! Scripted executor for loop tests.
//!
//! Responses are looked up by the request's prompt or path. Unscripted
//! requests succeed with `ok: <prompt>`. Delays use `tokio::time::sleep`, so
//! tests running with a paused clock stay deterministic.

use async_trait::async_trait;
use serde_json::Value;
use smithers_proto::{Error, ExecutionOutput, ExecutionRequest, Executor, Result, ToolResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Response {
    Output(ExecutionOutput),
    Failure(String),
}

/// One recorded executor call.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub path: String,
    pub prompt: String,
    pub model: Option<String>,
    pub iteration: u32,
    pub started: Instant,
    pub ended: Option<Instant>,
    pub tool_result: Option<ToolResult>,
}

/// Start or end of a call, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Start(String),
    End(String),
}

#[derive(Default)]
struct MockState {
    responses: HashMap<String, Response>,
    delays: HashMap<String, Duration>,
    tools: HashMap<String, (String, Value)>,
    calls: Vec<MockCall>,
    events: Vec<CallEvent>,
    running: usize,
    max_running: usize,
}

impl MockState {
    fn lookup<'a, T>(map: &'a HashMap<String, T>, request: &ExecutionRequest) -> Option<&'a T> {
        map.get(&request.prompt).or_else(|| map.get(&request.path))
    }
}

/// An [`Executor`] with scripted responses that records every call.
#[derive(Default)]
pub struct MockExecutor {
    state: Mutex<MockState>,
    default_delay: Duration,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Responds to `key` (prompt or path) with `output`.
    pub fn respond(self, key: impl Into<String>, output: impl Into<String>) -> Self {
        self.respond_with(key, ExecutionOutput::text(output))
    }

    pub fn respond_with(self, key: impl Into<String>, output: ExecutionOutput) -> Self {
        self.lock().responses.insert(key.into(), Response::Output(output));
        self
    }

    /// Fails requests for `key` with an executor error.
    pub fn fail(self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.lock()
            .responses
            .insert(key.into(), Response::Failure(message.into()));
        self
    }

    /// Delays requests for `key` before responding.
    pub fn delay(self, key: impl Into<String>, delay: Duration) -> Self {
        self.lock().delays.insert(key.into(), delay);
        self
    }

    /// Delay for requests without a specific delay.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Makes requests for `key` call tool `name` with `input` before responding.
    pub fn call_tool(self, key: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        self.lock().tools.insert(key.into(), (name.into(), input));
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Prompts of all calls, in start order.
    pub fn prompts(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.prompt.clone()).collect()
    }

    /// Paths of all calls, in start order.
    pub fn paths(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.path.clone()).collect()
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.lock().events.clone()
    }

    /// Highest number of calls in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.lock().max_running
    }

    fn finish(&self, index: usize, path: &str, tool_result: Option<ToolResult>) {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
        state.events.push(CallEvent::End(path.to_string()));
        if let Some(call) = state.calls.get_mut(index) {
            call.ended = Some(Instant::now());
            call.tool_result = tool_result;
        }
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput> {
        let (index, response, delay, tool) = {
            let mut state = self.lock();
            let response = MockState::lookup(&state.responses, &request).cloned();
            let delay = MockState::lookup(&state.delays, &request)
                .copied()
                .unwrap_or(self.default_delay);
            let tool = MockState::lookup(&state.tools, &request).cloned();

            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            state.events.push(CallEvent::Start(request.path.clone()));
            state.calls.push(MockCall {
                path: request.path.clone(),
                prompt: request.prompt.clone(),
                model: request.model.clone(),
                iteration: request.iteration,
                started: Instant::now(),
                ended: None,
                tool_result: None,
            });
            (state.calls.len() - 1, response, delay, tool)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut tool_result = None;
        if let Some((name, input)) = tool {
            let Some(tools) = &request.tools else {
                self.finish(index, &request.path, None);
                return Err(Error::Executor(format!("no tool runner for '{name}'")));
            };
            match tools.run_tool(&name, &input).await {
                Ok(result) => tool_result = Some(result),
                Err(e) => {
                    self.finish(index, &request.path, None);
                    return Err(e.into());
                }
            }
        }
        self.finish(index, &request.path, tool_result);

        match response {
            Some(Response::Output(output)) => Ok(output),
            Some(Response::Failure(message)) => Err(Error::Executor(message)),
            None => Ok(ExecutionOutput::text(format!("ok: {}", request.prompt))),
        }
    }
}
