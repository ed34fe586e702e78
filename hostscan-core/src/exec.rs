//! External command execution.
//!
//! Collectors never spawn processes themselves; they go through a
//! [`CommandRunner`] so every invocation carries its own timeout and tests can
//! replay canned output.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::runtime::Runtime;

/// How a command invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Ran and exited with status zero
    Success,
    /// Ran and exited non-zero, was killed by a signal, or could not be spawned
    Failed { exit_code: Option<i32> },
    /// Did not finish within its timeout and was killed
    TimedOut,
}

/// Captured output of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub status: CommandStatus,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            status: CommandStatus::Success,
        }
    }

    pub fn failed(stdout: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            stdout: stdout.into(),
            status: CommandStatus::Failed { exit_code },
        }
    }

    /// `stdout` holds whatever the command printed before it was killed
    pub fn timed_out(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            status: CommandStatus::TimedOut,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            CommandStatus::Success => Some(0),
            CommandStatus::Failed { exit_code } => exit_code,
            CommandStatus::TimedOut => None,
        }
    }

    /// Non-blank stdout lines, trimmed
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Runs shell command lines with a timeout
pub trait CommandRunner: Send + Sync {
    fn execute(&self, command: &str, timeout: Duration) -> CommandOutput;
}

/// Runs commands through `sh -c` on the local host
pub struct SystemCommandRunner {
    runtime: Runtime,
}

impl SystemCommandRunner {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start command runtime")?;
        Ok(Self { runtime })
    }
}

impl CommandRunner for SystemCommandRunner {
    fn execute(&self, command: &str, timeout: Duration) -> CommandOutput {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        self.runtime.block_on(capture(command, cmd, timeout))
    }
}

async fn capture(command: &str, mut cmd: Command, timeout: Duration) -> CommandOutput {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(command, error = %e, "command could not be spawned");
            return CommandOutput::failed(String::new(), None);
        }
    };

    // Read into a buffer we own so a timeout keeps what was printed so far
    let mut pipe = child.stdout.take();
    let mut buf = Vec::new();
    let finished = tokio::time::timeout(timeout, async {
        if let Some(pipe) = pipe.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        child.wait().await
    })
    .await;

    let stdout = String::from_utf8_lossy(&buf).into_owned();
    match finished {
        Ok(Ok(status)) if status.success() => CommandOutput::success(stdout),
        Ok(Ok(status)) => {
            tracing::debug!(command, code = ?status.code(), "command exited non-zero");
            CommandOutput::failed(stdout, status.code())
        }
        Ok(Err(e)) => {
            tracing::debug!(command, error = %e, "command output could not be read");
            CommandOutput::failed(stdout, None)
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                tracing::debug!(command, error = %e, "failed to kill timed out command");
            }
            tracing::debug!(command, timeout_ms = timeout.as_millis() as u64, "command timed out");
            CommandOutput::timed_out(stdout)
        }
    }
}

/// Quote a path for interpolation into a shell command line
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Replays canned output keyed by exact command line. Unknown commands fail.
    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: HashMap<String, CommandOutput>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn ok(mut self, command: &str, stdout: &str) -> Self {
            self.responses
                .insert(command.to_string(), CommandOutput::success(stdout));
            self
        }

        pub fn fail(mut self, command: &str, stdout: &str) -> Self {
            self.responses
                .insert(command.to_string(), CommandOutput::failed(stdout, Some(1)));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn execute(&self, command: &str, _timeout: Duration) -> CommandOutput {
            self.calls.lock().unwrap().push(command.to_string());
            self.responses
                .get(command)
                .cloned()
                .unwrap_or_else(|| CommandOutput::failed("", Some(127)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_exit_code_by_status() {
        assert_eq!(CommandOutput::success("x").exit_code(), Some(0));
        assert_eq!(CommandOutput::failed("", Some(2)).exit_code(), Some(2));
        assert_eq!(CommandOutput::timed_out("").exit_code(), None);
    }

    #[test]
    fn test_system_runner_distinguishes_outcomes() {
        let runner = SystemCommandRunner::new().unwrap();

        let ok = runner.execute("echo hello", Duration::from_secs(5));
        assert!(ok.is_success());
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = runner.execute("echo partial; exit 3", Duration::from_secs(5));
        assert_eq!(failed.status, CommandStatus::Failed { exit_code: Some(3) });
        assert_eq!(failed.stdout.trim(), "partial");

        let slow = runner.execute("sleep 5", Duration::from_millis(100));
        assert_eq!(slow.status, CommandStatus::TimedOut);
    }

    #[test]
    fn test_timeout_keeps_partial_output() {
        let runner = SystemCommandRunner::new().unwrap();

        let slow = runner.execute("echo first; echo second; sleep 5", Duration::from_millis(500));
        assert_eq!(slow.status, CommandStatus::TimedOut);
        assert_eq!(slow.lines().collect::<Vec<_>>(), vec!["first", "second"]);
    }
}
