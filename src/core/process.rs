//! External process execution seam.
//!
//! Every external tool (enumeration, sync, mount management, byte copy) is
//! launched through a [`ProcessRunner`], so the same operation code drives
//! real processes on Linux and scripted ones in simulation and tests.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;

/// How a process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn success() -> Self {
        Self { code: Some(0) }
    }

    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signalled() -> Self {
        Self { code: None }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit status {}", code),
            None => write!(f, "termination by signal"),
        }
    }
}

/// Captured result of a run-to-completion command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit: ExitOutcome,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stderr if it has content, otherwise stdout; trimmed.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// A long-running child whose diagnostic stream is read incrementally.
#[async_trait]
pub trait ChildProcessHandle: Send {
    /// Ask the process to emit a progress line now.
    fn request_progress(&mut self) -> std::io::Result<()>;

    /// Diagnostic lines that became available since the last call. Never blocks.
    fn poll_diagnostics(&mut self) -> Vec<String>;

    /// Exit outcome if the process has finished.
    fn try_wait(&mut self) -> std::io::Result<Option<ExitOutcome>>;

    /// Remaining diagnostic lines after the process exited.
    async fn drain_diagnostics(&mut self) -> Vec<String>;

    /// Signal the process to stop and wait for it to exit.
    async fn terminate(&mut self) -> std::io::Result<ExitOutcome>;
}

/// Launches external tools.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    async fn output(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput>;

    /// Spawn a long-running command with its diagnostic stream captured.
    fn spawn(
        &self,
        program: &Path,
        args: &[String],
    ) -> std::io::Result<Box<dyn ChildProcessHandle>>;
}
