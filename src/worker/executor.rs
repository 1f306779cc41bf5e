use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Why a command execution counts as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Process exited with a non-zero status code
    NonZeroExit(i32),
    /// Process terminated without an exit code (killed by a signal)
    Killed,
    /// Process outlived the execution timeout and was killed
    TimedOut,
    /// Process could not be started or its output could not be collected
    SpawnFailed(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::NonZeroExit(code) => write!(f, "exit code: {}", code),
            FailureReason::Killed => write!(f, "terminated by signal"),
            FailureReason::TimedOut => write!(f, "execution timed out"),
            FailureReason::SpawnFailed(msg) => write!(f, "spawn failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    Failure(FailureReason),
}

/// Captured result of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub outcome: ExecOutcome,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == ExecOutcome::Success
    }

    fn failure(reason: FailureReason) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            outcome: ExecOutcome::Failure(reason),
        }
    }
}

/// Runs job commands via `sh -c` with a hard timeout.
///
/// The executor only runs and classifies; retry decisions belong to the
/// caller and the store is never touched from here.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute `command` to completion or until the timeout elapses.
    ///
    /// Stdout and stderr are captured (lossy UTF-8, surrounding whitespace
    /// trimmed). A timed-out process is killed and reports
    /// [`FailureReason::TimedOut`]; its partial output is discarded.
    pub async fn execute(&self, command: &str) -> ExecutionResult {
        tracing::debug!(command, "Spawning command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => return ExecutionResult::failure(FailureReason::SpawnFailed(e.to_string())),
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let outcome = if output.status.success() {
                    ExecOutcome::Success
                } else {
                    ExecOutcome::Failure(match output.status.code() {
                        Some(code) => FailureReason::NonZeroExit(code),
                        None => FailureReason::Killed,
                    })
                };
                ExecutionResult {
                    stdout,
                    stderr,
                    outcome,
                }
            }
            Ok(Err(e)) => ExecutionResult::failure(FailureReason::SpawnFailed(e.to_string())),
            // Dropping the wait future drops the child handle; kill_on_drop
            // reaps the process.
            Err(_elapsed) => ExecutionResult::failure(FailureReason::TimedOut),
        }
    }
}
