//! Local command execution.
//!
//! Everything that leaves the process as a command line (the `ssh`
//! transport, reachability checks) goes through [`CommandExecutor`] so it can
//! be replaced by a recording mock in tests and by a dry-run executor in
//! `qcbake plan`.

mod pipe;
mod real;

use std::process::ExitStatus;

use anyhow::Result;

pub use real::RealCommandExecutor;

/// Formats arguments for logs and error messages, quoting them the way a
/// shell would need them.
pub(crate) fn format_command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .map(|part| shell_words::quote(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A command to execute.
#[derive(Clone)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment variables. Values are never logged.
    pub env: Vec<(String, String)>,
    /// Prefix for streamed output lines (e.g. the remote host).
    pub label: Option<String>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
            label: None,
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// The full command line, quoted.
    pub fn command_line(&self) -> String {
        format_command_line(&self.command, &self.args)
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("label", &self.label)
            .finish()
    }
}

/// Result of command execution
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit status of the command (None in dry-run mode)
    pub status: Option<ExitStatus>,
}

impl ExecutionResult {
    /// Returns true if the command succeeded. Dry runs always succeed.
    pub fn success(&self) -> bool {
        self.status.is_none_or(|s| s.success())
    }

    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Strategy for running local commands.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}
