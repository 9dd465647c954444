//! Remote-control commands for a running loop.
//!
//! Commands arrive as slash-prefixed lines (`/pause`, `/skip claude[0]`, ...),
//! are parsed into [`ControlCommand`]s, and are applied by the loop between
//! frames through a [`LoopHandle`].

use std::fmt;
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stop dispatching new nodes. Running nodes finish.
    Pause,
    Resume,
    /// Mark the node at a path (or the next eligible node) skipped.
    Skip(Option<String>),
    /// Queue text to prepend to the next dispatched prompt.
    Inject(String),
    Abort(String),
    Status,
    Tree { full: bool },
    Help(Option<String>),
    Approve(String),
    Reject(String),
}

/// Command name and one-line description, in help order.
const COMMANDS: &[(&str, &str, &str)] = &[
    ("pause", "/pause", "Stop dispatching new nodes; running nodes finish"),
    ("resume", "/resume", "Resume dispatching after /pause"),
    ("skip", "/skip [path]", "Mark a node (default: next eligible) as skipped"),
    ("inject", "/inject <text>", "Prepend text to the next dispatched prompt"),
    ("abort", "/abort <reason>", "Terminate the run"),
    ("status", "/status", "Show loop status"),
    ("tree", "/tree [--full]", "Show the current tree with execution status"),
    ("help", "/help [cmd]", "Show help"),
    ("approve", "/approve <id>", "Approve a pending human request"),
    ("reject", "/reject <id>", "Reject a pending human request"),
];

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Pause => "pause",
            ControlCommand::Resume => "resume",
            ControlCommand::Skip(_) => "skip",
            ControlCommand::Inject(_) => "inject",
            ControlCommand::Abort(_) => "abort",
            ControlCommand::Status => "status",
            ControlCommand::Tree { .. } => "tree",
            ControlCommand::Help(_) => "help",
            ControlCommand::Approve(_) => "approve",
            ControlCommand::Reject(_) => "reject",
        }
    }
}

/// Help for one command, or the full command list.
pub fn help_text(command: Option<&str>) -> String {
    match command.map(|c| c.trim_start_matches('/')) {
        Some(name) => COMMANDS
            .iter()
            .find(|(n, _, _)| *n == name)
            .map_or_else(
                || format!("Unknown command: /{name}"),
                |(_, usage, description)| format!("{usage}  {description}"),
            ),
        None => {
            let mut out = String::from("Commands:");
            for (_, usage, description) in COMMANDS {
                out.push_str(&format!("\n  {usage:<18} {description}"));
            }
            out
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("commands start with '/'")]
    NotACommand,

    #[error("unknown command: /{0}")]
    Unknown(String),

    #[error("/{command} requires {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
}

impl FromStr for ControlCommand {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let rest = line.strip_prefix('/').ok_or(CommandParseError::NotACommand)?;
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        let arg = (!arg.is_empty()).then(|| arg.to_string());

        match name {
            "pause" => Ok(ControlCommand::Pause),
            "resume" => Ok(ControlCommand::Resume),
            "skip" => Ok(ControlCommand::Skip(arg)),
            "inject" => Ok(ControlCommand::Inject(required(arg, "inject", "<text>")?)),
            "abort" => Ok(ControlCommand::Abort(required(arg, "abort", "<reason>")?)),
            "status" => Ok(ControlCommand::Status),
            "tree" => Ok(ControlCommand::Tree {
                full: arg.as_deref() == Some("--full"),
            }),
            "help" => Ok(ControlCommand::Help(arg)),
            "approve" => Ok(ControlCommand::Approve(required(arg, "approve", "<id>")?)),
            "reject" => Ok(ControlCommand::Reject(required(arg, "reject", "<id>")?)),
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }
}

fn required(
    arg: Option<String>,
    command: &'static str,
    argument: &'static str,
) -> Result<String, CommandParseError> {
    arg.ok_or(CommandParseError::MissingArgument { command, argument })
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Skip(Some(arg))
            | ControlCommand::Inject(arg)
            | ControlCommand::Abort(arg)
            | ControlCommand::Help(Some(arg))
            | ControlCommand::Approve(arg)
            | ControlCommand::Reject(arg) => write!(f, "/{} {arg}", self.name()),
            ControlCommand::Tree { full: true } => write!(f, "/tree --full"),
            _ => write!(f, "/{}", self.name()),
        }
    }
}

/// Why a command could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Parse(#[from] CommandParseError),

    #[error("{0}")]
    Rejected(String),

    #[error("execution loop is not running")]
    LoopGone,
}

pub(crate) struct CommandRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<Result<String, CommandError>>,
}

/// Cloneable handle for steering a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<CommandRequest>,
}

impl LoopHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CommandRequest>) -> Self {
        Self { tx }
    }

    /// Applies a command and returns the loop's reply.
    ///
    /// `/help` is answered locally. Other commands are queued and applied
    /// between frames.
    pub async fn execute(&self, command: ControlCommand) -> Result<String, CommandError> {
        if let ControlCommand::Help(topic) = &command {
            return Ok(help_text(topic.as_deref()));
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CommandRequest { command, reply })
            .map_err(|_| CommandError::LoopGone)?;
        rx.await.map_err(|_| CommandError::LoopGone)?
    }

    /// Parses and applies one command line.
    pub async fn execute_line(&self, line: &str) -> Result<String, CommandError> {
        self.execute(line.parse()?).await
    }

    pub async fn abort(&self, reason: impl Into<String>) -> Result<String, CommandError> {
        self.execute(ControlCommand::Abort(reason.into())).await
    }

    pub async fn pause(&self) -> Result<String, CommandError> {
        self.execute(ControlCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<String, CommandError> {
        self.execute(ControlCommand::Resume).await
    }

    pub async fn inject(&self, text: impl Into<String>) -> Result<String, CommandError> {
        self.execute(ControlCommand::Inject(text.into())).await
    }

    pub async fn skip(&self, path: Option<&str>) -> Result<String, CommandError> {
        self.execute(ControlCommand::Skip(path.map(str::to_string)))
            .await
    }

    pub async fn approve(&self, request_id: impl Into<String>) -> Result<String, CommandError> {
        self.execute(ControlCommand::Approve(request_id.into())).await
    }

    pub async fn reject(&self, request_id: impl Into<String>) -> Result<String, CommandError> {
        self.execute(ControlCommand::Reject(request_id.into())).await
    }

    pub async fn status(&self) -> Result<String, CommandError> {
        self.execute(ControlCommand::Status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("/pause".parse(), Ok(ControlCommand::Pause));
        assert_eq!(" /resume ".parse(), Ok(ControlCommand::Resume));
        assert_eq!("/skip".parse(), Ok(ControlCommand::Skip(None)));
        assert_eq!(
            "/skip group[0]/claude[1]".parse(),
            Ok(ControlCommand::Skip(Some("group[0]/claude[1]".to_string())))
        );
        assert_eq!(
            "/inject focus on tests please".parse(),
            Ok(ControlCommand::Inject("focus on tests please".to_string()))
        );
        assert_eq!("/tree".parse(), Ok(ControlCommand::Tree { full: false }));
        assert_eq!("/tree --full".parse(), Ok(ControlCommand::Tree { full: true }));
        assert_eq!(
            "/help skip".parse(),
            Ok(ControlCommand::Help(Some("skip".to_string())))
        );
        assert_eq!(
            "/approve group[0]/human[0]".parse(),
            Ok(ControlCommand::Approve("group[0]/human[0]".to_string()))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "pause".parse::<ControlCommand>(),
            Err(CommandParseError::NotACommand)
        );
        assert_eq!(
            "/launch".parse::<ControlCommand>(),
            Err(CommandParseError::Unknown("launch".to_string()))
        );
        let err = "/abort".parse::<ControlCommand>().unwrap_err();
        assert_eq!(err.to_string(), "/abort requires <reason>");
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for line in ["/pause", "/skip claude[0]", "/tree --full", "/reject gate-1"] {
            let command: ControlCommand = line.parse().unwrap();
            assert_eq!(command.to_string(), line);
        }
    }

    #[test]
    fn test_help_text() {
        let all = help_text(None);
        assert!(all.starts_with("Commands:"));
        assert_eq!(all.lines().count(), COMMANDS.len() + 1);
        assert!(help_text(Some("/inject")).starts_with("/inject <text>"));
        assert_eq!(help_text(Some("nope")), "Unknown command: /nope");
    }

    #[tokio::test]
    async fn test_help_is_answered_without_a_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = LoopHandle::new(tx);
        assert!(handle.execute_line("/help").await.unwrap().contains("/abort"));
        assert_eq!(handle.pause().await, Err(CommandError::LoopGone));
    }
}
