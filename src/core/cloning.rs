//! Raw block copy of a device or partition through the copy tool.
//!
//! The copy runs as a child process. A polling loop asks it for a progress
//! line every tick, turns the cumulative byte count into a percentage of the
//! source size, and publishes it to the device store and the caller's status
//! channel. Cancellation terminates the child and waits for it before the
//! device is released.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::logging::LogThrottle;

use super::error::{CloneError, CloneFailure, OperationError};
use super::models::DeviceAction;
use super::operations::DriveOps;
use super::process::{ChildProcessHandle, ExitOutcome};
use super::store::CloneSource;

// "5000 bytes (5.0 kB, 4.9 KiB) copied, 0.01 s, 500 kB/s"
static BYTES_COPIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+) bytes\b.*\bcopied").expect("progress pattern is valid")
});

// "9+1 records in"
static RECORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\+\d+ records (in|out)\s*$").expect("records pattern is valid"));

/// Strictly increasing progress values fit without the sender ever waiting.
const STATUS_CHANNEL_CAPACITY: usize = 128;

/// Diagnostic lines kept for the failure message.
const MAX_DIAGNOSTIC_LINES: usize = 8;

/// Cumulative byte count from a copy tool progress line.
pub fn parse_bytes_copied(line: &str) -> Option<u64> {
    BYTES_COPIED
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Floor percentage of `total`, clamped to 100. Unknown size reports 0.
pub fn percentage(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (bytes as u128 * 100) / total as u128;
    pct.min(100) as u8
}

/// `<dir>/<node-name>-<timestamp>.img`
pub fn default_destination(backup_dir: &Path, node: &Path, now: DateTime<Local>) -> PathBuf {
    let stem = node
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "drive".to_string());
    backup_dir.join(format!("{}-{}.img", stem, now.format("%Y%m%d-%H%M%S")))
}

/// Status updates published while a clone runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CloneStatus {
    Started {
        source: PathBuf,
        destination: PathBuf,
        total_bytes: u64,
    },
    Progress {
        bytes_copied: u64,
        percentage: u8,
    },
    Completed {
        bytes_copied: u64,
        duration_secs: u64,
    },
    Failed(String),
    Cancelled,
}

impl CloneStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed(_) | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct CloneRequest {
    /// Kernel name of a device or one of its partitions.
    pub target: String,
    pub destination: PathBuf,
    /// Overrides the configured block size.
    pub block_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSummary {
    pub device: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub bytes_copied: u64,
    pub duration_secs: u64,
}

/// A running clone: its status stream, a cancel switch and the final result.
pub struct CloneHandle {
    device: String,
    cancel: CancellationToken,
    status_rx: mpsc::Receiver<CloneStatus>,
    task: JoinHandle<Result<CloneSummary, OperationError>>,
}

impl CloneHandle {
    /// Kernel name of the device whose state this clone drives.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Request cancellation. Takes effect within one poll interval.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next status update; `None` once the clone has finished and all
    /// updates were consumed.
    pub async fn next_status(&mut self) -> Option<CloneStatus> {
        self.status_rx.recv().await
    }

    /// Next status update if one is already queued.
    pub fn try_status(&mut self) -> Option<CloneStatus> {
        self.status_rx.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the clone to end, discarding unread status updates.
    pub async fn wait(self) -> Result<CloneSummary, OperationError> {
        let Self {
            status_rx, task, ..
        } = self;
        drop(status_rx);

        match task.await {
            Ok(result) => result,
            Err(e) => Err(CloneError {
                kind: CloneFailure::Other,
                exit_code: None,
                message: format!("clone task failed: {}", e),
            }
            .into()),
        }
    }
}

/// Tracks the highest byte count seen and the percentage derived from it.
#[derive(Debug)]
struct CopyProgress {
    total: u64,
    bytes_copied: u64,
    percentage: u8,
}

impl CopyProgress {
    fn new(total: u64) -> Self {
        Self {
            total,
            bytes_copied: 0,
            percentage: 0,
        }
    }

    /// Returns the new percentage if it increased.
    fn update(&mut self, bytes: u64) -> Option<u8> {
        self.bytes_copied = self.bytes_copied.max(bytes);
        let pct = percentage(self.bytes_copied, self.total);
        if pct > self.percentage {
            self.percentage = pct;
            Some(pct)
        } else {
            None
        }
    }
}

impl DriveOps {
    /// Start cloning a device or partition to `request.destination`.
    ///
    /// Fails immediately if the target is unknown, its device is busy, or the
    /// copy tool cannot be launched. Otherwise the copy runs on its own task.
    pub async fn start_clone(&self, request: CloneRequest) -> Result<CloneHandle, OperationError> {
        let source = self
            .store
            .resolve_source(&request.target)
            .await
            .ok_or_else(|| OperationError::DeviceNotFound(request.target.clone()))?;

        self.store.begin(&source.device, DeviceAction::Cloning).await?;

        let block_size = request.block_size.unwrap_or(self.clone_cfg.block_size).max(1);
        let args = vec![
            format!("if={}", source.node.display()),
            format!("of={}", request.destination.display()),
            format!("bs={}", block_size),
            "status=progress".to_string(),
        ];

        let child = match self.runner.spawn(&self.tools.dd, &args) {
            Ok(child) => child,
            Err(e) => {
                self.store.finish(&source.device).await;
                return Err(OperationError::Spawn {
                    program: self.tools.dd.clone(),
                    source: e,
                });
            }
        };

        let (tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let device = source.device.clone();

        let span = info_span!(
            "clone",
            device = %source.device,
            source = %source.node.display(),
            destination = %request.destination.display()
        );
        let ops = self.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(
            async move {
                ops.drive_copy(source, request.destination, child, task_cancel, tx)
                    .await
            }
            .instrument(span),
        );

        Ok(CloneHandle {
            device,
            cancel,
            status_rx,
            task,
        })
    }

    /// Clone and wait for the result, forwarding status updates to `on_status`.
    pub async fn clone_device(
        &self,
        request: CloneRequest,
        mut on_status: impl FnMut(&CloneStatus),
    ) -> Result<CloneSummary, OperationError> {
        let mut handle = self.start_clone(request).await?;
        while let Some(status) = handle.next_status().await {
            on_status(&status);
        }
        handle.wait().await
    }

    async fn drive_copy(
        &self,
        source: CloneSource,
        destination: PathBuf,
        mut child: Box<dyn ChildProcessHandle>,
        cancel: CancellationToken,
        tx: mpsc::Sender<CloneStatus>,
    ) -> Result<CloneSummary, OperationError> {
        let started = Instant::now();
        let mut copy = CopyProgress::new(source.size);
        let mut diagnostics: Vec<String> = Vec::new();
        let mut throttle = LogThrottle::new(Duration::from_secs(5));

        info!(total_bytes = source.size, "Clone started");
        let _ = tx
            .send(CloneStatus::Started {
                source: source.node.clone(),
                destination: destination.clone(),
                total_bytes: source.size,
            })
            .await;
        let _ = tx
            .send(CloneStatus::Progress {
                bytes_copied: 0,
                percentage: 0,
            })
            .await;

        let mut ticker = tokio::time::interval(self.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; give the tool time to start.
        ticker.tick().await;

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.cancel_copy(&source, child.as_mut(), &tx).await;
                }
                _ = ticker.tick() => {
                    match child.try_wait() {
                        Ok(Some(exit)) => break exit,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "Lost track of copy process");
                            break ExitOutcome::signalled();
                        }
                    }

                    if let Err(e) = child.request_progress() {
                        debug!(error = %e, "Progress request failed");
                    }
                    let lines = child.poll_diagnostics();
                    self.absorb(&source, lines, &mut copy, &mut diagnostics, &tx).await;

                    if throttle.should_log() {
                        debug!(
                            bytes_copied = copy.bytes_copied,
                            percentage = copy.percentage,
                            "Clone progress"
                        );
                    }
                }
            }
        };

        let rest = child.drain_diagnostics().await;
        self.absorb(&source, rest, &mut copy, &mut diagnostics, &tx)
            .await;

        let duration_secs = started.elapsed().as_secs();

        if exit.is_success() {
            if copy.percentage < 100 {
                copy.percentage = 100;
                self.store.set_progress(&source.device, 100).await;
                let _ = tx
                    .send(CloneStatus::Progress {
                        bytes_copied: copy.bytes_copied,
                        percentage: 100,
                    })
                    .await;
            }
            self.store.finish(&source.device).await;

            info!(
                bytes_copied = copy.bytes_copied,
                duration_secs = duration_secs,
                "Clone complete"
            );
            let _ = tx
                .send(CloneStatus::Completed {
                    bytes_copied: copy.bytes_copied,
                    duration_secs,
                })
                .await;

            return Ok(CloneSummary {
                device: source.device,
                source: source.node,
                destination,
                bytes_copied: copy.bytes_copied,
                duration_secs,
            });
        }

        let message = if diagnostics.is_empty() {
            format!("{} {}", self.tools.dd.display(), exit)
        } else {
            diagnostics.join("\n")
        };
        let error = CloneError {
            kind: CloneFailure::classify(&message),
            exit_code: exit.code,
            message,
        };

        self.store.finish(&source.device).await;
        warn!(status = %exit, error = %error, "Clone failed");
        let _ = tx.send(CloneStatus::Failed(error.to_string())).await;
        Err(error.into())
    }

    async fn cancel_copy(
        &self,
        source: &CloneSource,
        child: &mut dyn ChildProcessHandle,
        tx: &mpsc::Sender<CloneStatus>,
    ) -> Result<CloneSummary, OperationError> {
        info!("Cancelling clone");
        match child.terminate().await {
            Ok(exit) => debug!(status = %exit, "Copy process stopped"),
            Err(e) => warn!(error = %e, "Failed to stop copy process"),
        }
        self.store.finish(&source.device).await;
        let _ = tx.send(CloneStatus::Cancelled).await;
        Err(OperationError::Cancelled)
    }

    /// Feed diagnostic lines into the progress tracker.
    async fn absorb(
        &self,
        source: &CloneSource,
        lines: Vec<String>,
        copy: &mut CopyProgress,
        diagnostics: &mut Vec<String>,
        tx: &mpsc::Sender<CloneStatus>,
    ) {
        for line in lines {
            if let Some(bytes) = parse_bytes_copied(&line) {
                if let Some(pct) = copy.update(bytes) {
                    self.store.set_progress(&source.device, pct).await;
                    let _ = tx
                        .send(CloneStatus::Progress {
                            bytes_copied: copy.bytes_copied,
                            percentage: pct,
                        })
                        .await;
                }
                continue;
            }

            let line = line.trim();
            if line.is_empty() || RECORDS.is_match(line) {
                continue;
            }
            if diagnostics.len() == MAX_DIAGNOSTIC_LINES {
                diagnostics.remove(0);
            }
            diagnostics.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_gnu_progress_lines() {
        assert_eq!(
            parse_bytes_copied("5000 bytes (5.0 kB, 4.9 KiB) copied, 0.01 s, 500 kB/s"),
            Some(5000)
        );
        assert_eq!(
            parse_bytes_copied("  1048576 bytes (1.0 MB, 1.0 MiB) copied, 1 s, 1.0 MB/s"),
            Some(1_048_576)
        );
        assert_eq!(parse_bytes_copied("1048576 bytes (1.0 MB) copied, 1.2 s"), Some(1_048_576));
    }

    #[test]
    fn ignores_other_lines() {
        assert_eq!(parse_bytes_copied("9+1 records in"), None);
        assert_eq!(parse_bytes_copied("dd: failed to open '/dev/sdb': Permission denied"), None);
        assert_eq!(parse_bytes_copied("garbage bytes copied"), None);
        assert_eq!(parse_bytes_copied(""), None);
    }

    #[test]
    fn percentage_floors_and_clamps() {
        assert_eq!(percentage(0, 5000), 0);
        assert_eq!(percentage(1000, 5000), 20);
        assert_eq!(percentage(2500, 5000), 50);
        assert_eq!(percentage(4999, 5000), 99);
        assert_eq!(percentage(6000, 5000), 100);
        assert_eq!(percentage(10, 0), 0);
        assert_eq!(percentage(u64::MAX, u64::MAX), 100);
    }

    #[test]
    fn progress_only_moves_forward() {
        let mut copy = CopyProgress::new(5000);
        assert_eq!(copy.update(0), None);
        assert_eq!(copy.update(1000), Some(20));
        assert_eq!(copy.update(500), None);
        assert_eq!(copy.bytes_copied, 1000);
        assert_eq!(copy.update(1010), None);
        assert_eq!(copy.update(5000), Some(100));
    }

    #[test]
    fn default_destination_uses_node_name_and_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let path = default_destination(Path::new("/srv/backups"), Path::new("/dev/sdb1"), now);
        assert_eq!(path, PathBuf::from("/srv/backups/sdb1-20240309-140507.img"));
    }

    #[test]
    fn records_lines_are_recognised() {
        assert!(RECORDS.is_match("9+1 records in"));
        assert!(RECORDS.is_match("10+0 records out"));
        assert!(!RECORDS.is_match("dd: error reading '/dev/sdb'"));
    }
}
