//! # smithers-adapters
//!
//! Concrete collaborators for the Smithers execution loop.
//!
//! - [`CliExecutor`] runs an executable node's prompt through an external
//!   command (the `claude` CLI by default) and returns its stdout.
//! - [`ShellToolRunner`] serves the `shell` tool by running `sh -c`.
//! - [`EchoExecutor`] answers every prompt with the prompt itself, for dry runs.

mod cli_backend;
mod cli_executor;
mod echo;
mod shell_tool;

pub use cli_backend::{CliBackend, PromptMode};
pub use cli_executor::{CliExecutor, CommandOutput};
pub use echo::EchoExecutor;
pub use shell_tool::{SHELL_TOOL, ShellToolRunner};
