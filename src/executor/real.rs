//! [`RealCommandExecutor`]: runs commands with `std::process::Command`.

use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use which::which;

use super::pipe::{StreamType, read_pipe_to_log};
use super::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::{QcbakeError, panic_message};

/// Kills the child and joins whatever reader threads were started.
fn abandon_child<I>(child: &mut Child, readers: I)
where
    I: IntoIterator<Item = JoinHandle<()>>,
{
    let pid = child.id();
    if let Err(e) = child.kill() {
        tracing::debug!(pid, "kill returned error (process may have already exited): {}", e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid, "failed to reap child process after kill: {}", e);
    }
    for handle in readers {
        if let Err(e) = handle.join() {
            tracing::warn!("reader thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>, stream: StreamType, label: String) -> std::io::Result<JoinHandle<()>>
where
    R: std::io::Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{}-reader", stream))
        .spawn(move || read_pipe_to_log(pipe, stream, &label))
}

/// Command executor that runs actual system commands.
///
/// With `dry_run` set, commands are logged but not executed and every call
/// returns `ExecutionResult { status: None }`.
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let command_line = spec.command_line();
        if self.dry_run {
            tracing::info!("dry run: {}", command_line);
            return Ok(ExecutionResult { status: None });
        }

        let program =
            which(&spec.command).with_context(|| format!("command not found: {}", spec.command))?;
        tracing::trace!("resolved {} to {}", spec.command, program.display());

        let mut command = Command::new(program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", command_line))?;
        tracing::trace!(pid = child.id(), "spawned: {}", command_line);

        let label = spec.label.clone().unwrap_or_else(|| spec.command.clone());
        let failed = |status: String| QcbakeError::Execution {
            command: command_line.clone(),
            status,
        };

        let stdout = match spawn_reader(child.stdout.take(), StreamType::Stdout, label.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                abandon_child(&mut child, []);
                return Err(failed(format!("failed to spawn stdout reader thread: {}", e)).into());
            }
        };
        let stderr = match spawn_reader(child.stderr.take(), StreamType::Stderr, label) {
            Ok(handle) => handle,
            Err(e) => {
                abandon_child(&mut child, [stdout]);
                return Err(failed(format!("failed to spawn stderr reader thread: {}", e)).into());
            }
        };

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                abandon_child(&mut child, [stdout, stderr]);
                return Err(failed(format!("failed to wait for command: {}", e)).into());
            }
        };

        let panicked: Vec<String> = [("stdout", stdout), ("stderr", stderr)]
            .into_iter()
            .filter_map(|(name, handle)| {
                handle.join().err().map(|e| {
                    let message = panic_message(&*e);
                    tracing::error!(stream = name, panic = message, "reader thread panicked");
                    format!("{}: {}", name, message)
                })
            })
            .collect();
        if !panicked.is_empty() {
            return Err(failed(format!(
                "reader thread(s) panicked during command execution: {}",
                panicked.join(", ")
            ))
            .into());
        }

        tracing::trace!("{} exited: success={}", spec.command, status.success());
        Ok(ExecutionResult {
            status: Some(status),
        })
    }
}
