//! The single process-execution capability.
//!
//! Every external command in the system funnels through [`CommandRunner`].
//! The system implementation validates the command name against the
//! allow-list and every argument against the character-class whitelist, runs
//! without a shell, and enforces a per-call timeout. Tests substitute a
//! recording fake.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

use crate::validate::{validate_command_args, validate_command_name, ExecError, ExecResult};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn ok() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            status: 0,
        }
    }

    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: 0,
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status,
        }
    }
}

/// Convert a non-zero exit into a typed error.
pub fn expect_success(command: &str, output: CommandOutput) -> ExecResult<CommandOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(ExecError::ExecFailed {
            command: command.to_string(),
            status: output.status,
            stderr: mano_core::sanitize::sanitize_for_log(&output.stderr),
        })
    }
}

/// Markers in stderr that make a delete idempotent rather than failed.
pub fn is_not_found_output(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_ascii_lowercase();
    stderr.contains("cannot find device")
        || stderr.contains("no such file or directory")
        || stderr.contains("does not exist")
        || stderr.contains("no such device")
        || stderr.contains("invalid handle")
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run an allow-listed command to completion. A non-zero exit status is a
    /// normal result; spawning or timing out is an error.
    async fn run(&self, command: &str, args: &[String]) -> ExecResult<CommandOutput>;
}

/// Production runner backed by `tokio::process`. Never invokes a shell.
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &str, args: &[String]) -> ExecResult<CommandOutput> {
        validate_command_name(command)?;
        validate_command_args(command, args)?;

        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ExecError::Spawn {
                    command: command.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ExecError::Timeout {
                    command: command.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        };
        tracing::trace!(
            command,
            status = result.status,
            "external command completed"
        );
        Ok(result)
    }
}

/// Test fake: records every invocation and replays scripted outputs.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    scripted: Mutex<VecDeque<ExecResult<CommandOutput>>>,
    /// When true, invocations are validated exactly like the system runner.
    pub validate: bool,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            validate: true,
        }
    }

    pub fn push_output(&self, output: CommandOutput) {
        self.scripted.lock().unwrap().push_back(Ok(output));
    }

    pub fn push_error(&self, error: ExecError) {
        self.scripted.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|(cmd, args)| format!("{} {}", cmd, args.join(" ")))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &str, args: &[String]) -> ExecResult<CommandOutput> {
        if self.validate {
            validate_command_name(command)?;
            validate_command_args(command, args)?;
        }
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), args.to_vec()));
        match self.scripted.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(CommandOutput::ok()),
        }
    }
}
