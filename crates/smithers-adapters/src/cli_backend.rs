//! Command-line backends an executable node's prompt can be sent through.

use serde::{Deserialize, Serialize};

/// How to pass prompts to the command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Pass prompt as a command-line argument.
    #[default]
    Arg,
    /// Write prompt to stdin.
    Stdin,
}

/// A command plus the conventions for handing it a prompt and a model.
///
/// Deserializes from the `executor` section of a workflow file:
///
/// ```yaml
/// executor:
///   command: claude
///   args: ["--dangerously-skip-permissions"]
///   prompt_flag: "-p"
///   model_flag: "--model"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliBackend {
    /// The command to execute.
    pub command: String,
    /// Additional arguments before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub prompt_mode: PromptMode,
    /// Argument flag for prompt (if prompt_mode is Arg).
    #[serde(default)]
    pub prompt_flag: Option<String>,
    /// Argument flag carrying a node's model override. Without one the
    /// model is not passed.
    #[serde(default)]
    pub model_flag: Option<String>,
}

impl Default for CliBackend {
    fn default() -> Self {
        Self::claude()
    }
}

impl CliBackend {
    /// The Claude CLI in headless print mode.
    pub fn claude() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--dangerously-skip-permissions".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-p".to_string()),
            model_flag: Some("--model".to_string()),
        }
    }

    /// An arbitrary command taking the prompt as its last positional argument.
    pub fn custom(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            prompt_mode: PromptMode::Arg,
            prompt_flag: None,
            model_flag: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prompt_mode(mut self, mode: PromptMode) -> Self {
        self.prompt_mode = mode;
        self
    }

    /// Builds the full command line for one call.
    ///
    /// Returns the command, its arguments, and the stdin payload (set only
    /// in [`PromptMode::Stdin`]).
    pub fn build_command(
        &self,
        prompt: &str,
        model: Option<&str>,
    ) -> (String, Vec<String>, Option<String>) {
        let mut args = self.args.clone();

        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }

        let stdin_input = match self.prompt_mode {
            PromptMode::Arg => {
                if let Some(flag) = &self.prompt_flag {
                    args.push(flag.clone());
                }
                args.push(prompt.to_string());
                None
            }
            PromptMode::Stdin => Some(prompt.to_string()),
        };

        (self.command.clone(), args, stdin_input)
    }
}
