//! Real process execution and filesystem statistics on Linux.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::sys::statvfs::statvfs;
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::error::ProbeError;
use crate::core::process::{ChildProcessHandle, CommandOutput, ExitOutcome, ProcessRunner};
use crate::core::usage::{Usage, UsageProber};

/// How long to wait for a finished child's diagnostic pipe to close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_BUFFER_SIZE: usize = 4096;

/// Runs external tools with `tokio::process`.
pub struct SystemProcessRunner {
    terminate_grace: Duration,
}

impl SystemProcessRunner {
    pub fn new(terminate_grace: Duration) -> Self {
        Self { terminate_grace }
    }
}

impl Default for SystemProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn command(program: &Path, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    // Progress lines are parsed, so keep the tool's messages untranslated.
    cmd.args(args).env("LC_ALL", "C").stdin(Stdio::null());
    cmd
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn output(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
        debug!(program = %program.display(), ?args, "Running command");
        let output = command(program, args).output().await?;
        Ok(CommandOutput {
            exit: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(
        &self,
        program: &Path,
        args: &[String],
    ) -> std::io::Result<Box<dyn ChildProcessHandle>> {
        debug!(program = %program.display(), ?args, "Spawning command");
        let mut child = command(program, args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr was not captured"))?;

        let (tx, lines) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_lines(stderr, tx));

        Ok(Box::new(SystemChild {
            child,
            lines,
            reader: Some(reader),
            terminate_grace: self.terminate_grace,
        }))
    }
}

/// Split a diagnostic stream into lines on `\r` or `\n`.
///
/// Progress tools rewrite one terminal line with carriage returns, so both
/// count as line ends.
async fn read_lines<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut line = Vec::new();

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Diagnostic stream read failed");
                break;
            }
        };

        for &byte in &buffer[..n] {
            if byte == b'\r' || byte == b'\n' {
                if !line.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&line).into_owned());
                    line.clear();
                }
            } else {
                line.push(byte);
            }
        }
    }

    if !line.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&line).into_owned());
    }
}

struct SystemChild {
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
    reader: Option<JoinHandle<()>>,
    terminate_grace: Duration,
}

impl SystemChild {
    fn signal(&self, signal: Signal) -> std::io::Result<()> {
        // No id means the child has already been reaped.
        let Some(id) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(id as i32), signal).map_err(std::io::Error::from)
    }
}

#[async_trait]
impl ChildProcessHandle for SystemChild {
    fn request_progress(&mut self) -> std::io::Result<()> {
        self.signal(Signal::SIGUSR1)
    }

    fn poll_diagnostics(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = self.lines.try_recv() {
            out.push(line);
        }
        out
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(ExitOutcome::from))
    }

    async fn drain_diagnostics(&mut self) -> Vec<String> {
        if let Some(reader) = self.reader.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                warn!("Diagnostic stream did not close after exit");
            }
        }
        self.poll_diagnostics()
    }

    async fn terminate(&mut self) -> std::io::Result<ExitOutcome> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }

        self.signal(Signal::SIGTERM)?;
        let waited = tokio::time::timeout(self.terminate_grace, self.child.wait()).await;
        match waited {
            Ok(status) => Ok(status?.into()),
            Err(_) => {
                warn!("Process ignored SIGTERM, killing");
                self.child.kill().await?;
                Ok(ExitOutcome::signalled())
            }
        }
    }
}

/// Usage from `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProber;

impl UsageProber for StatvfsProber {
    fn probe(&self, mount_point: &Path) -> Result<Usage, ProbeError> {
        let stat = statvfs(mount_point).map_err(|errno| ProbeError {
            mount_point: mount_point.to_path_buf(),
            source: std::io::Error::from(errno),
        })?;

        let fragment = stat.fragment_size() as u64;
        let block = if fragment > 0 {
            fragment
        } else {
            stat.block_size() as u64
        };

        let total = (stat.blocks() as u64).saturating_mul(block);
        let free = (stat.blocks_free() as u64).saturating_mul(block);
        Ok(Usage {
            total,
            used: total.saturating_sub(free),
            free: (stat.blocks_available() as u64).saturating_mul(block),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_lines_splits_on_carriage_returns() {
        let input: &[u8] = b"100 bytes copied\r200 bytes copied\r\n3+0 records in\npartial";
        let (tx, mut rx) = mpsc::unbounded_channel();
        read_lines(input, tx).await;

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(
            lines,
            vec![
                "100 bytes copied",
                "200 bytes copied",
                "3+0 records in",
                "partial"
            ]
        );
    }

    #[test]
    fn test_statvfs_root() {
        let usage = StatvfsProber.probe(Path::new("/")).unwrap();
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
    }

    #[test]
    fn test_statvfs_missing_path() {
        let err = StatvfsProber
            .probe(Path::new("/nonexistent/mount/point"))
            .unwrap_err();
        assert_eq!(err.mount_point, Path::new("/nonexistent/mount/point"));
    }

    #[tokio::test]
    async fn test_output_captures_exit_status() {
        let runner = SystemProcessRunner::default();
        let out = runner
            .output(Path::new("sh"), &["-c".to_string(), "echo hi; exit 3".to_string()])
            .await
            .unwrap();
        assert_eq!(out.exit, ExitOutcome::code(3));
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn test_terminate_stops_child() {
        let runner = SystemProcessRunner::new(Duration::from_secs(2));
        let mut child = runner
            .spawn(Path::new("sleep"), &["30".to_string()])
            .unwrap();
        assert!(child.try_wait().unwrap().is_none());

        let exit = child.terminate().await.unwrap();
        assert!(!exit.is_success());
    }
}
